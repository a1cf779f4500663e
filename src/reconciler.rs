use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::storyboard::{artifact_stem, AssembledClip, SourceMode, StoryboardEntry};

const STAGING_PREFIX: &str = ".staging-";

/// 产物文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// 分镜记录 `storyboard_{n}.json`
    Record,
    /// 分镜视频 `storyboard_{n}.mp4`
    Clip,
}

impl ArtifactKind {
    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Record => "json",
            ArtifactKind::Clip => "mp4",
        }
    }
}

/// 解析规范文件名 `storyboard_{n}.json|mp4`，其他文件返回 None
pub fn parse_artifact_name(name: &str) -> Option<(usize, ArtifactKind)> {
    let rest = name.strip_prefix("storyboard_")?;
    let (digits, ext) = rest.split_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kind = match ext {
        "json" => ArtifactKind::Record,
        "mp4" => ArtifactKind::Clip,
        _ => return None,
    };
    Some((digits.parse().ok()?, kind))
}

pub fn artifact_filename(index: usize, kind: ArtifactKind) -> String {
    format!("{}.{}", artifact_stem(index), kind.extension())
}

/// 分镜视频在记录里的描述（文件名为规范名）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipRecord {
    pub file: String,
    pub duration: f64,
    pub source_mode: SourceMode,
    pub generated_at: String,
}

/// `storyboard_{n}.json` 的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry: StoryboardEntry,
    #[serde(default)]
    pub clip: Option<ClipRecord>,
    pub saved_at: String,
}

/// 待写入的分镜及其视频
#[derive(Debug, Clone)]
pub struct PendingArtifact {
    pub entry: StoryboardEntry,
    pub clip: Option<AssembledClip>,
}

/// 按分镜序号把合成结果配对
pub fn pair_clips(entries: &[StoryboardEntry], clips: &[AssembledClip]) -> Vec<PendingArtifact> {
    let by_index: HashMap<usize, &AssembledClip> = clips.iter().map(|c| (c.index, c)).collect();
    entries
        .iter()
        .map(|entry| PendingArtifact {
            entry: entry.clone(),
            clip: by_index.get(&entry.index).map(|c| (*c).clone()),
        })
        .collect()
}

/// 一次重建的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub records: usize,
    pub clips: usize,
    /// 删除的旧规范文件数
    pub removed: usize,
}

/// 产物目录重建器，是产物目录的唯一写入方
///
/// 先把所有新文件写到目录内的暂存区，全部成功后才删除旧的规范文件并把暂存文件改名到位。
/// 暂存失败时旧文件保持不变；删除之后出错会返回 `ReconciliationIo`，原样重试即可收敛。
/// 同一目录的并发重建需要调用方串行化（见 [`ProjectLocks`]）。
pub struct ArtifactReconciler {
    artifact_dir: PathBuf,
}

impl ArtifactReconciler {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// 按列表位置（1..N）重建产物目录
    pub fn reconcile(&self, artifacts: &[PendingArtifact]) -> PipelineResult<ReconcileReport> {
        let start = Instant::now();
        info!(
            "⏳ [产物重建] 正在重建 {}，分镜数: {}",
            self.artifact_dir.display(),
            artifacts.len()
        );
        std::fs::create_dir_all(&self.artifact_dir).map_err(|e| PipelineError::reconcile("stage", e))?;
        self.remove_stale_staging();

        let staging = self.artifact_dir.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        let staged = match self.stage(&staging, artifacts) {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                    debug!("清理暂存目录失败: {} - {}", staging.display(), cleanup);
                }
                error!("❌ [产物重建] 暂存失败，旧产物保持不变: {}", e);
                return Err(PipelineError::reconcile("stage", e));
            }
        };

        let removed = self.clear().map_err(|e| {
            error!("❌ [产物重建] 删除旧产物失败，目录处于不完整状态: {}", e);
            PipelineError::reconcile("clear", e)
        })?;

        for name in &staged {
            std::fs::rename(staging.join(name), self.artifact_dir.join(name)).map_err(|e| {
                error!(
                    "❌ [产物重建] 提交 {} 失败，目录处于不完整状态，暂存文件保留在 {}: {}",
                    name,
                    staging.display(),
                    e
                );
                PipelineError::reconcile("commit", e)
            })?;
        }
        if let Err(e) = std::fs::remove_dir(&staging) {
            warn!("⚠️  [产物重建] 删除暂存目录失败: {} - {}", staging.display(), e);
        }

        let clips = staged
            .iter()
            .filter(|name| matches!(parse_artifact_name(name), Some((_, ArtifactKind::Clip))))
            .count();
        let report = ReconcileReport {
            records: artifacts.len(),
            clips,
            removed,
        };
        info!(
            "✅ [产物重建] 完成：写入记录 {} 个，视频 {} 个，删除旧文件 {} 个，耗时: {:.2}秒",
            report.records,
            report.clips,
            report.removed,
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// 把新文件写入暂存区，返回写入的文件名
    fn stage(&self, staging: &Path, artifacts: &[PendingArtifact]) -> std::io::Result<Vec<String>> {
        std::fs::create_dir_all(staging)?;
        let saved_at = chrono::Utc::now().to_rfc3339();
        let mut staged = Vec::with_capacity(artifacts.len() * 2);

        for (position, artifact) in artifacts.iter().enumerate() {
            let index = position + 1;
            let clip = match &artifact.clip {
                Some(clip) => {
                    let file = artifact_filename(index, ArtifactKind::Clip);
                    std::fs::copy(&clip.path, staging.join(&file)).map_err(|e| {
                        std::io::Error::new(e.kind(), format!("复制 {} 失败: {}", clip.path.display(), e))
                    })?;
                    staged.push(file.clone());
                    Some(ClipRecord {
                        file,
                        duration: clip.duration,
                        source_mode: clip.source_mode,
                        generated_at: clip.generated_at.clone(),
                    })
                }
                None => None,
            };

            let mut entry = artifact.entry.clone();
            if entry.index != index {
                debug!("分镜 {} 重新编号为 {}", entry.index, index);
            }
            entry.index = index;
            let record = EntryRecord {
                entry,
                clip,
                saved_at: saved_at.clone(),
            };
            let file = artifact_filename(index, ArtifactKind::Record);
            let json = serde_json::to_string_pretty(&record)?;
            std::fs::write(staging.join(&file), json)?;
            staged.push(file);
        }
        Ok(staged)
    }

    /// 删除目录中所有规范命名的文件，其他文件不动
    fn clear(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.artifact_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if parse_artifact_name(name).is_some() && entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 清掉之前中断留下的暂存目录
    fn remove_stale_staging(&self) {
        let Ok(read_dir) = std::fs::read_dir(&self.artifact_dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!("⚠️  [产物重建] 删除上次遗留的暂存目录: {}", entry.path().display());
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    warn!("⚠️  [产物重建] 删除失败: {}", e);
                }
            }
        }
    }

    /// 目录中已有的分镜视频（按旧序号查找）
    pub fn existing_clip(&self, index: usize) -> Option<PathBuf> {
        let path = self.artifact_dir.join(artifact_filename(index, ArtifactKind::Clip));
        path.is_file().then_some(path)
    }

    /// 读取目录中所有分镜记录，按序号排序
    pub fn load_records(&self) -> PipelineResult<Vec<EntryRecord>> {
        let mut records = Vec::new();
        for index in list_artifacts(&self.artifact_dir)? {
            let path = self.artifact_dir.join(artifact_filename(index, ArtifactKind::Record));
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            records.push(serde_json::from_str(&content)?);
        }
        Ok(records)
    }
}

/// 列出目录中出现的规范产物序号（升序）
pub fn list_artifacts(dir: impl AsRef<Path>) -> PipelineResult<Vec<usize>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut indices = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some((index, _)) = entry.file_name().to_str().and_then(parse_artifact_name) {
            indices.insert(index);
        }
    }
    Ok(indices.into_iter().collect())
}

/// 按产物目录划分的异步互斥锁，供调用方串行化同一项目的保存
#[derive(Debug, Clone, Default)]
pub struct ProjectLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取目录对应的锁（同一目录总是同一把锁）
    pub fn lock_for(&self, dir: impl AsRef<Path>) -> Arc<tokio::sync::Mutex<()>> {
        let key = dir
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| dir.as_ref().to_path_buf());
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key).or_default().clone()
    }

    /// 等待并持有目录锁
    pub async fn acquire(&self, dir: impl AsRef<Path>) -> tokio::sync::OwnedMutexGuard<()> {
        self.lock_for(dir).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TimeWindow;
    use crate::storyboard::{EntryMetadata, WindowResolution};

    fn entry(index: usize, description: &str) -> StoryboardEntry {
        StoryboardEntry {
            index,
            resolution: WindowResolution::Explicit {
                window: TimeWindow::new(index as f64, index as f64 + 1.0),
            },
            scene_id: None,
            dialogue: String::new(),
            metadata: EntryMetadata {
                description: Some(description.to_string()),
                ..Default::default()
            },
        }
    }

    fn clip_in(dir: &Path, index: usize, content: &str) -> AssembledClip {
        let path = dir.join(format!("render_{}.mp4", index));
        std::fs::write(&path, content).unwrap();
        AssembledClip {
            index,
            path,
            duration: 1.0,
            source_mode: SourceMode::OriginalCrop,
            generated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn file_names(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    fn pending(render: &Path, labels: &[(usize, &str)]) -> Vec<PendingArtifact> {
        labels
            .iter()
            .map(|&(index, label)| PendingArtifact {
                entry: entry(index, label),
                clip: Some(clip_in(render, index, label)),
            })
            .collect()
    }

    #[test]
    fn test_parse_artifact_name() {
        assert_eq!(parse_artifact_name("storyboard_12.json"), Some((12, ArtifactKind::Record)));
        assert_eq!(parse_artifact_name("storyboard_3.mp4"), Some((3, ArtifactKind::Clip)));
        assert_eq!(parse_artifact_name("storyboard_.mp4"), None);
        assert_eq!(parse_artifact_name("storyboard_1.mp4.bak"), None);
        assert_eq!(parse_artifact_name("storyboard_x.json"), None);
        assert_eq!(parse_artifact_name("notes.txt"), None);
    }

    #[test]
    fn test_shrinking_list_leaves_no_stale_files() {
        let artifacts = tempfile::tempdir().unwrap();
        let render = tempfile::tempdir().unwrap();
        std::fs::write(artifacts.path().join("notes.txt"), "keep me").unwrap();
        let reconciler = ArtifactReconciler::new(artifacts.path());

        let five = pending(render.path(), &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
        reconciler.reconcile(&five).unwrap();
        assert_eq!(list_artifacts(artifacts.path()).unwrap(), vec![1, 2, 3, 4, 5]);

        // 删掉中间两个分镜后重新保存
        let three = vec![five[0].clone(), five[3].clone(), five[4].clone()];
        let report = reconciler.reconcile(&three).unwrap();
        assert_eq!(report.removed, 10);
        assert_eq!(report.records, 3);

        let expected: BTreeSet<String> = [
            "notes.txt",
            "storyboard_1.json",
            "storyboard_1.mp4",
            "storyboard_2.json",
            "storyboard_2.mp4",
            "storyboard_3.json",
            "storyboard_3.mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(file_names(artifacts.path()), expected);

        let records = reconciler.load_records().unwrap();
        let labels: Vec<_> = records
            .iter()
            .map(|r| r.entry.metadata.description.clone().unwrap())
            .collect();
        assert_eq!(labels, vec!["a", "d", "e"]);
        assert_eq!(records[1].entry.index, 2);
        assert_eq!(std::fs::read_to_string(artifacts.path().join("storyboard_2.mp4")).unwrap(), "d");
    }

    #[test]
    fn test_file_count_matches_entry_count() {
        let artifacts = tempfile::tempdir().unwrap();
        let reconciler = ArtifactReconciler::new(artifacts.path());
        for n in [4usize, 0, 2, 6, 1] {
            let list: Vec<PendingArtifact> = (1..=n)
                .map(|i| PendingArtifact {
                    entry: entry(i, "x"),
                    clip: None,
                })
                .collect();
            reconciler.reconcile(&list).unwrap();
            let indices = list_artifacts(artifacts.path()).unwrap();
            assert_eq!(indices, (1..=n).collect::<Vec<_>>());
            assert_eq!(file_names(artifacts.path()).len(), n);
        }
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let artifacts = tempfile::tempdir().unwrap();
        let render = tempfile::tempdir().unwrap();
        let reconciler = ArtifactReconciler::new(artifacts.path());
        let list = pending(render.path(), &[(1, "a"), (2, "b")]);

        reconciler.reconcile(&list).unwrap();
        let first = file_names(artifacts.path());
        reconciler.reconcile(&list).unwrap();
        assert_eq!(file_names(artifacts.path()), first);
    }

    #[test]
    fn test_staging_failure_keeps_previous_set() {
        let artifacts = tempfile::tempdir().unwrap();
        let render = tempfile::tempdir().unwrap();
        let reconciler = ArtifactReconciler::new(artifacts.path());
        reconciler
            .reconcile(&pending(render.path(), &[(1, "a"), (2, "b")]))
            .unwrap();
        let before = file_names(artifacts.path());

        let mut broken = pending(render.path(), &[(1, "c")]);
        if let Some(clip) = broken[0].clip.as_mut() {
            clip.path = render.path().join("missing.mp4");
        }
        let err = reconciler.reconcile(&broken).unwrap_err();
        assert!(matches!(err, PipelineError::ReconciliationIo { phase: "stage", .. }));
        assert!(err.is_retryable());
        assert_eq!(file_names(artifacts.path()), before);
    }

    #[test]
    fn test_stale_staging_dir_is_removed() {
        let artifacts = tempfile::tempdir().unwrap();
        let stale = artifacts.path().join(".staging-left-over");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("storyboard_1.json"), "{}").unwrap();

        ArtifactReconciler::new(artifacts.path()).reconcile(&[]).unwrap();
        assert!(file_names(artifacts.path()).is_empty());
    }

    #[test]
    fn test_reorder_with_clips_already_in_directory() {
        let artifacts = tempfile::tempdir().unwrap();
        let render = tempfile::tempdir().unwrap();
        let reconciler = ArtifactReconciler::new(artifacts.path());
        reconciler
            .reconcile(&pending(render.path(), &[(1, "a"), (2, "b"), (3, "c")]))
            .unwrap();

        // 调换顺序，视频直接取目录中按旧序号命名的文件
        let reordered: Vec<PendingArtifact> = [3usize, 1]
            .iter()
            .map(|&old| {
                let path = reconciler.existing_clip(old).unwrap();
                PendingArtifact {
                    entry: entry(old, "moved"),
                    clip: Some(AssembledClip {
                        index: old,
                        path,
                        duration: 1.0,
                        source_mode: SourceMode::ImageFallback,
                        generated_at: String::new(),
                    }),
                }
            })
            .collect();
        reconciler.reconcile(&reordered).unwrap();

        assert_eq!(list_artifacts(artifacts.path()).unwrap(), vec![1, 2]);
        assert_eq!(std::fs::read_to_string(artifacts.path().join("storyboard_1.mp4")).unwrap(), "c");
        assert_eq!(std::fs::read_to_string(artifacts.path().join("storyboard_2.mp4")).unwrap(), "a");
    }

    #[test]
    fn test_pair_clips_by_index() {
        let render = tempfile::tempdir().unwrap();
        let entries = vec![entry(1, "a"), entry(2, "b")];
        let clips = vec![clip_in(render.path(), 2, "b")];
        let paired = pair_clips(&entries, &clips);
        assert!(paired[0].clip.is_none());
        assert_eq!(paired[1].clip.as_ref().map(|c| c.index), Some(2));
    }

    #[tokio::test]
    async fn test_project_locks_share_per_directory() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let locks = ProjectLocks::new();
        assert!(Arc::ptr_eq(&locks.lock_for(dir_a.path()), &locks.lock_for(dir_a.path())));
        assert!(!Arc::ptr_eq(&locks.lock_for(dir_a.path()), &locks.lock_for(dir_b.path())));

        let guard = locks.acquire(dir_a.path()).await;
        assert!(locks.lock_for(dir_a.path()).try_lock().is_err());
        assert!(locks.lock_for(dir_b.path()).try_lock().is_ok());
        drop(guard);
        assert!(locks.lock_for(dir_a.path()).try_lock().is_ok());
    }
}
