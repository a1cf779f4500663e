use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::scene_detector::FrameMetric;

/// 缓存文件内容
#[derive(Debug, Serialize, Deserialize)]
struct CachedMetrics {
    video_key: String,
    analysis_width: u32,
    created_at: String,
    metrics: Vec<FrameMetric>,
}

/// 逐帧指标缓存，按视频文件身份（路径、大小、修改时间）区分
///
/// 只是加速重复检测的优化：读不到或读坏的缓存一律当作未命中。
#[derive(Debug, Clone)]
pub struct StatsCache {
    dir: PathBuf,
}

impl StatsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 计算视频文件的身份键
    pub fn key_for(video_path: &Path, analysis_width: u32) -> std::io::Result<String> {
        let meta = std::fs::metadata(video_path)?;
        let canonical = video_path
            .canonicalize()
            .unwrap_or_else(|_| video_path.to_path_buf());
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut hasher = Sha1::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(analysis_width.to_le_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.stats.json", key))
    }

    pub fn load(&self, key: &str, analysis_width: u32) -> Option<Vec<FrameMetric>> {
        let path = self.file_for(key);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CachedMetrics>(&content) {
            Ok(cached) if cached.video_key == key && cached.analysis_width == analysis_width => {
                info!("📦 [帧指标缓存] 命中缓存: {} ({} 帧)", path.display(), cached.metrics.len());
                Some(cached.metrics)
            }
            Ok(_) => {
                debug!("帧指标缓存键不匹配，忽略: {}", path.display());
                None
            }
            Err(e) => {
                warn!("⚠️  [帧指标缓存] 缓存文件损坏，忽略: {} - {}", path.display(), e);
                None
            }
        }
    }

    pub fn store(&self, key: &str, analysis_width: u32, metrics: &[FrameMetric]) -> PipelineResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let cached = CachedMetrics {
            video_key: key.to_string(),
            analysis_width,
            created_at: chrono::Utc::now().to_rfc3339(),
            metrics: metrics.to_vec(),
        };
        let path = self.file_for(key);
        std::fs::write(&path, serde_json::to_string(&cached)?)?;
        debug!("帧指标已缓存: {}", path.display());
        Ok(())
    }
}
