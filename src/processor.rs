use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aligner::{seeds_from_scenes, Aligner};
use crate::clip_assembler::{ClipAssembler, NarrationTrack};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::keyframe_sampler::KeyframeSampler;
use crate::metadata::{Keyframe, Scene, TranscriptSegment, VideoAnalysis};
use crate::reconciler::{pair_clips, ArtifactReconciler, ReconcileReport};
use crate::record::{ProcessingRecord, RunStatus, Stage};
use crate::scene_detector::SceneDetector;
use crate::stats_cache::StatsCache;
use crate::storyboard::{AssembledClip, EntrySeed, StoryboardEntry};
use crate::transcriber::{SpeechEngine, Transcriber, WhisperCliEngine};
use crate::video_processor::VideoProcessor;

/// 一次处理请求
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// 输入视频文件路径
    pub input: PathBuf,
    /// 项目目录，下设 analysis/、keyframes/、storyboard/
    pub project_dir: PathBuf,
    /// 上游生成的分镜种子，未提供时每个场景一个分镜
    pub seeds: Option<Vec<EntrySeed>>,
    /// 单独的配音音轨
    pub narration: Option<PathBuf>,
}

/// 处理结果
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub analysis: VideoAnalysis,
    pub entries: Vec<StoryboardEntry>,
    pub clips: Vec<AssembledClip>,
    pub report: ReconcileReport,
    /// 全部分镜拼接成的完整视频，拼接失败或没有分镜视频时为 None
    pub composed: Option<PathBuf>,
    pub record: ProcessingRecord,
    /// 处理记录文件路径
    pub record_path: PathBuf,
}

/// 项目目录布局
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub analysis_dir: PathBuf,
    pub keyframe_dir: PathBuf,
    pub render_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// 拼接后的完整视频，放在产物目录之外
    pub final_video: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            analysis_dir: project_dir.join("analysis"),
            keyframe_dir: project_dir.join("keyframes"),
            render_dir: project_dir.join(".render"),
            artifact_dir: project_dir.join("storyboard"),
            final_video: project_dir.join("storyboard_video.mp4"),
        }
    }

    pub fn record_path(&self) -> PathBuf {
        self.analysis_dir.join("processing_record.json")
    }
}

/// 分镜流水线：探测 → 场景检测 ∥ 语音转录 → 关键帧 → 对齐 → 剪辑合成 → 产物重建 → 视频拼接
pub struct StoryboardPipeline {
    config: PipelineConfig,
    engine: Arc<dyn SpeechEngine>,
}

impl StoryboardPipeline {
    pub fn new(config: PipelineConfig, engine: Arc<dyn SpeechEngine>) -> Self {
        Self { config, engine }
    }

    /// 使用配置中的 whisper 命令行作为识别引擎
    pub fn with_whisper(config: PipelineConfig) -> Self {
        let engine = WhisperCliEngine::new(config.transcriber.program.clone(), config.transcriber.model.clone());
        Self::new(config, Arc::new(engine))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn scene_detector(&self) -> SceneDetector {
        let d = &self.config.detector;
        let detector = SceneDetector::new(d.threshold, d.mode, d.min_scene_len).with_analysis_width(d.analysis_width);
        match &d.stats_cache_dir {
            Some(dir) => detector.with_cache(StatsCache::new(dir)),
            None => detector,
        }
    }

    /// 只做场景检测和关键帧采样
    pub async fn detect(
        &self,
        input: impl AsRef<Path>,
        project_dir: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> PipelineResult<VideoAnalysis> {
        let layout = ProjectLayout::new(project_dir.as_ref());
        let input = input.as_ref().to_path_buf();
        let processor = tokio::task::spawn_blocking(move || VideoProcessor::open(input)).await??;

        let scenes = {
            let detector = self.scene_detector();
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || detector.detect(&processor, &cancel)).await??
        };
        write_json(&layout.analysis_dir.join("scenes.json"), &scenes)?;

        let keyframes = {
            let sampler = KeyframeSampler::new(&layout.keyframe_dir);
            let processor = processor.clone();
            let scenes = scenes.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || sampler.sample(&processor, &scenes, &cancel)).await??
        };
        write_json(&layout.analysis_dir.join("keyframes.json"), &keyframes)?;

        Ok(VideoAnalysis {
            source: processor.source().clone(),
            scenes,
            keyframes,
            transcript: Vec::new(),
            analyzed_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// 运行完整流水线
    ///
    /// 探测、场景检测、产物重建失败或被取消时返回错误；转录、关键帧、拼接失败或个别分镜合成失败时
    /// 继续执行，结果记录在处理记录里。无论成败都会写出 `analysis/processing_record.json`。
    pub async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> PipelineResult<PipelineOutput> {
        let total_start = Instant::now();
        let layout = ProjectLayout::new(&request.project_dir);
        let mut record = ProcessingRecord::new(&request.input);

        info!("🎬 [分镜流水线] 开始处理视频: {}", request.input.display());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        std::fs::create_dir_all(&layout.analysis_dir)?;

        // 1. 探测视频
        record.start(Stage::Probe);
        let input = request.input.clone();
        let processor = match tokio::task::spawn_blocking(move || VideoProcessor::open(input))
            .await
            .map_err(PipelineError::from)
            .and_then(|r| r)
        {
            Ok(processor) => processor,
            Err(e) => return Err(self.abort(&mut record, &layout, Stage::Probe, e).await),
        };
        let source = processor.source().clone();
        record.complete(
            Stage::Probe,
            format!("{:.2}s, {:.2} fps, {}x{}", source.duration, source.fps, source.width, source.height),
        );

        // 2. 场景检测与语音转录互不依赖，并行执行
        record.start(Stage::SceneDetection);
        record.start(Stage::Transcription);
        let scene_task = {
            let detector = self.scene_detector();
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || detector.detect(&processor, &cancel))
        };
        let transcribe_task = {
            let transcriber = Transcriber::new(self.engine.clone(), self.config.assembler.ffmpeg_program.clone());
            let source = source.clone();
            let language = self.config.transcriber.language.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || transcriber.transcribe(&source, language.as_deref(), &cancel))
        };
        let (scene_result, transcript_result) = tokio::join!(scene_task, transcribe_task);

        // 先记下转录结果，场景检测失败时处理记录里也能看到转录阶段的真实状态
        let transcript = settle_transcript(&mut record, transcript_result.map_err(PipelineError::from).and_then(|r| r));
        write_json(&layout.analysis_dir.join("transcript.json"), &transcript)?;

        let scenes: Vec<Scene> = match scene_result.map_err(PipelineError::from).and_then(|r| r) {
            Ok(scenes) => scenes,
            Err(e) => return Err(self.abort(&mut record, &layout, Stage::SceneDetection, e).await),
        };
        record.complete(Stage::SceneDetection, format!("{} 个场景", scenes.len()));
        write_json(&layout.analysis_dir.join("scenes.json"), &scenes)?;

        // 3. 关键帧
        if cancel.is_cancelled() {
            return Err(self.abort(&mut record, &layout, Stage::KeyframeSampling, PipelineError::Cancelled).await);
        }
        record.start(Stage::KeyframeSampling);
        let keyframe_result = {
            let sampler = KeyframeSampler::new(&layout.keyframe_dir);
            let processor = processor.clone();
            let scenes = scenes.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || sampler.sample(&processor, &scenes, &cancel))
                .await
                .map_err(PipelineError::from)
                .and_then(|r| r)
        };
        let keyframes: Vec<Keyframe> = match keyframe_result {
            Ok(keyframes) => {
                record.complete(Stage::KeyframeSampling, format!("{} 张关键帧", keyframes.len()));
                keyframes
            }
            Err(PipelineError::Cancelled) => {
                return Err(self.abort(&mut record, &layout, Stage::KeyframeSampling, PipelineError::Cancelled).await)
            }
            Err(e) => {
                warn!("⚠️  [关键帧] 采样失败，回退合成将不可用: {}", e);
                record.fail(Stage::KeyframeSampling, &e);
                Vec::new()
            }
        };
        write_json(&layout.analysis_dir.join("keyframes.json"), &keyframes)?;

        // 4. 对齐
        record.start(Stage::Alignment);
        let seeds = request.seeds.clone().unwrap_or_else(|| seeds_from_scenes(&scenes));
        let entries = Aligner::new(self.config.assembler.default_duration).align(source.duration, &scenes, &transcript, &seeds);
        record.complete(
            Stage::Alignment,
            format!(
                "{} 个分镜，{} 个未解析",
                entries.len(),
                entries.iter().filter(|e| !e.is_resolved()).count()
            ),
        );

        // 5. 剪辑合成
        if cancel.is_cancelled() {
            return Err(self.abort(&mut record, &layout, Stage::ClipAssembly, PipelineError::Cancelled).await);
        }
        record.start(Stage::ClipAssembly);
        let outcomes = {
            let assembler = ClipAssembler::new(self.config.assembler.clone(), &layout.render_dir);
            let entries = entries.clone();
            let source = source.clone();
            let keyframes = keyframes.clone();
            let narration_path = request.narration.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let narration = narration_path.and_then(|path| match NarrationTrack::open(&path) {
                    Ok(track) => Some(track),
                    Err(e) => {
                        warn!("⚠️  [剪辑合成] 配音音轨不可用，忽略: {} - {}", path.display(), e);
                        None
                    }
                });
                assembler.assemble_all(&entries, Some(&source), &keyframes, narration.as_ref(), &cancel)
            })
            .await?
        };

        let mut clips = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(clip) => clips.push(clip),
                Err(PipelineError::Cancelled) => {
                    return Err(self.abort(&mut record, &layout, Stage::ClipAssembly, PipelineError::Cancelled).await)
                }
                Err(e) => record.record_entry_failure(outcome.index, &e),
            }
        }
        let summary = format!("{}/{} 个分镜合成成功", clips.len(), entries.len());
        if clips.is_empty() && !entries.is_empty() {
            record.fail(Stage::ClipAssembly, summary);
        } else {
            record.complete(Stage::ClipAssembly, summary);
        }

        // 6. 产物重建
        if cancel.is_cancelled() {
            return Err(self.abort(&mut record, &layout, Stage::Reconciliation, PipelineError::Cancelled).await);
        }
        record.start(Stage::Reconciliation);
        let reconcile_result = {
            let reconciler = ArtifactReconciler::new(&layout.artifact_dir);
            let artifacts = pair_clips(&entries, &clips);
            tokio::task::spawn_blocking(move || reconciler.reconcile(&artifacts))
                .await
                .map_err(PipelineError::from)
                .and_then(|r| r)
        };
        let report = match reconcile_result {
            Ok(report) => report,
            Err(e) => return Err(self.abort(&mut record, &layout, Stage::Reconciliation, e).await),
        };
        record.complete(
            Stage::Reconciliation,
            format!("记录 {} 个，视频 {} 个", report.records, report.clips),
        );
        if let Err(e) = std::fs::remove_dir_all(&layout.render_dir) {
            warn!("⚠️  [分镜流水线] 清理渲染目录失败: {} - {}", layout.render_dir.display(), e);
        }

        // 7. 视频拼接
        record.start(Stage::Composition);
        let reconciler = ArtifactReconciler::new(&layout.artifact_dir);
        let clip_paths: Vec<PathBuf> = (1..=entries.len()).filter_map(|i| reconciler.existing_clip(i)).collect();
        let composed = if clip_paths.is_empty() {
            record.complete(Stage::Composition, "没有分镜视频，跳过拼接");
            None
        } else {
            let compose_result = {
                let assembler = ClipAssembler::new(self.config.assembler.clone(), &layout.render_dir);
                let output = layout.final_video.clone();
                let clip_paths = clip_paths.clone();
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || assembler.compose(&clip_paths, &output, &cancel))
                    .await
                    .map_err(PipelineError::from)
                    .and_then(|r| r)
            };
            match compose_result {
                Ok(path) => {
                    record.complete(Stage::Composition, format!("{} 个分镜 → {}", clip_paths.len(), path.display()));
                    Some(path)
                }
                Err(PipelineError::Cancelled) => {
                    return Err(self.abort(&mut record, &layout, Stage::Composition, PipelineError::Cancelled).await)
                }
                Err(e) => {
                    // 分镜产物已经就位，拼接失败只降级为部分成功
                    warn!("⚠️  [视频拼接] 失败: {}", e);
                    record.fail(Stage::Composition, &e);
                    None
                }
            }
        };

        let status = record.finish();
        let record_path = layout.record_path();
        record.save(&record_path)?;
        self.notify(&record).await;

        let total = total_start.elapsed();
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "🎉 [分镜流水线] 处理结束（{:?}），总耗时: {:.2}秒",
            status,
            total.as_secs_f64()
        );
        info!("  • 场景数: {} 个", scenes.len());
        info!("  • 关键帧数: {} 张", keyframes.len());
        info!("  • 转录片段: {} 个", transcript.len());
        info!("  • 分镜视频: {}/{}", clips.len(), entries.len());
        info!("📁 [分镜流水线] 产物目录: {}", layout.artifact_dir.display());
        if let Some(path) = &composed {
            info!("🎞️  [分镜流水线] 完整视频: {}", path.display());
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        Ok(PipelineOutput {
            analysis: VideoAnalysis {
                source,
                scenes,
                keyframes,
                transcript,
                analyzed_at: chrono::Utc::now().to_rfc3339(),
            },
            entries,
            clips,
            report,
            composed,
            record,
            record_path,
        })
    }

    /// 记录致命失败，保存处理记录并回调，返回原错误
    async fn abort(
        &self,
        record: &mut ProcessingRecord,
        layout: &ProjectLayout,
        stage: Stage,
        err: PipelineError,
    ) -> PipelineError {
        error!("❌ [{}] {}", stage, err);
        record.abort(stage, &err);
        if let Err(e) = record.save(layout.record_path()) {
            warn!("⚠️  [分镜流水线] 保存处理记录失败: {}", e);
        }
        self.notify(record).await;
        err
    }

    async fn notify(&self, record: &ProcessingRecord) {
        let Some(webhook_url) = &self.config.webhook_url else {
            return;
        };
        info!("⏳ [分镜流水线] 正在调用 Webhook 回调...");
        match call_webhook(webhook_url, record).await {
            Ok(()) => info!("✅ [分镜流水线] Webhook 回调成功"),
            Err(e) => warn!("⚠️  [分镜流水线] Webhook 回调失败: {:#}", e),
        }
    }
}

/// 记录转录阶段的结果；转录失败只影响台词，返回空列表让后续阶段照常进行
fn settle_transcript(
    record: &mut ProcessingRecord,
    result: PipelineResult<Vec<TranscriptSegment>>,
) -> Vec<TranscriptSegment> {
    match result {
        Ok(segments) => {
            record.complete(Stage::Transcription, format!("{} 个片段", segments.len()));
            segments
        }
        Err(e) => {
            warn!("⚠️  [语音转录] 失败，台词将为空: {}", e);
            record.fail(Stage::Transcription, &e);
            Vec::new()
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Webhook 回调数据结构
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    /// 处理状态
    status: RunStatus,
    /// 输入视频路径
    input_video: String,
    /// 处理记录
    record: &'a ProcessingRecord,
    /// 回调时间戳
    timestamp: String,
}

/// 调用 webhook 回调
async fn call_webhook(webhook_url: &str, record: &ProcessingRecord) -> anyhow::Result<()> {
    let payload = WebhookPayload {
        status: record.status,
        input_video: record.source.to_string_lossy().to_string(),
        record,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(&payload)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .context("Webhook 请求失败")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Webhook 返回错误状态: {} - {}", status, error_text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StepStatus;

    struct SilentEngine;

    impl SpeechEngine for SilentEngine {
        fn name(&self) -> &str {
            "silent"
        }

        fn transcribe(
            &self,
            _audio_path: &Path,
            _language: Option<&str>,
            _cancel: &CancellationToken,
        ) -> PipelineResult<Vec<TranscriptSegment>> {
            Ok(Vec::new())
        }
    }

    struct OfflineEngine;

    impl SpeechEngine for OfflineEngine {
        fn name(&self) -> &str {
            "offline"
        }

        fn transcribe(
            &self,
            _audio_path: &Path,
            _language: Option<&str>,
            _cancel: &CancellationToken,
        ) -> PipelineResult<Vec<TranscriptSegment>> {
            Err(PipelineError::TranscriptionFailed("engine offline".to_string()))
        }
    }

    /// 用 ffmpeg 生成 4 秒带音轨的测试视频；没有 ffmpeg 时返回 None
    fn sample_video(dir: &Path) -> Option<PathBuf> {
        which::which("ffmpeg").ok()?;
        let path = dir.join("sample.mp4");
        let status = std::process::Command::new("ffmpeg")
            .args(["-loglevel", "error", "-nostdin"])
            .args(["-f", "lavfi", "-i", "testsrc=duration=4:size=320x240:rate=25"])
            .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=4"])
            .args(["-c:v", "mpeg4", "-c:a", "aac", "-shortest", "-y"])
            .arg(&path)
            .status()
            .ok()?;
        status.success().then_some(path)
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.assembler.video_codec = "mpeg4".to_string();
        config.assembler.width = 320;
        config.assembler.height = 240;
        config
    }

    #[test]
    fn test_project_layout() {
        let layout = ProjectLayout::new(Path::new("/projects/demo"));
        assert_eq!(layout.artifact_dir, PathBuf::from("/projects/demo/storyboard"));
        assert_eq!(layout.final_video, PathBuf::from("/projects/demo/storyboard_video.mp4"));
        assert_eq!(
            layout.record_path(),
            PathBuf::from("/projects/demo/analysis/processing_record.json")
        );
    }

    #[tokio::test]
    async fn test_missing_source_fails_probe_and_writes_record() {
        let project = tempfile::tempdir().unwrap();
        let pipeline = StoryboardPipeline::new(PipelineConfig::default(), Arc::new(SilentEngine));
        let request = PipelineRequest {
            input: project.path().join("missing.mp4"),
            project_dir: project.path().to_path_buf(),
            ..Default::default()
        };

        let err = pipeline.run(request, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound(_)));

        let saved = std::fs::read_to_string(ProjectLayout::new(project.path()).record_path()).unwrap();
        let record: ProcessingRecord = serde_json::from_str(&saved).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.step(Stage::Probe).unwrap().status, StepStatus::Failed);
        assert_eq!(record.step(Stage::SceneDetection).unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_transcription_failure_keeps_pipeline_going() {
        let mut record = ProcessingRecord::new("in.mp4");
        let transcript = settle_transcript(&mut record, Err(PipelineError::EngineUnavailable("whisper".into())));
        assert!(transcript.is_empty());
        let step = record.step(Stage::Transcription).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap().contains("whisper"));
    }

    #[tokio::test]
    async fn test_offline_engine_gives_partial_run() {
        let project = tempfile::tempdir().unwrap();
        let Some(input) = sample_video(project.path()) else {
            return;
        };
        let pipeline = StoryboardPipeline::new(test_config(), Arc::new(OfflineEngine));
        let request = PipelineRequest {
            input,
            project_dir: project.path().join("project"),
            ..Default::default()
        };

        let output = pipeline.run(request, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.record.status, RunStatus::Partial);
        assert_eq!(output.record.step(Stage::Transcription).unwrap().status, StepStatus::Failed);
        assert_eq!(output.record.step(Stage::SceneDetection).unwrap().status, StepStatus::Completed);
        assert_eq!(output.record.step(Stage::Reconciliation).unwrap().status, StepStatus::Completed);
        assert!(output.analysis.transcript.is_empty());
        assert!(!output.entries.is_empty());
        assert!(output.entries.iter().all(|e| e.dialogue.is_empty()));

        let saved = std::fs::read_to_string(&output.record_path).unwrap();
        let record: ProcessingRecord = serde_json::from_str(&saved).unwrap();
        assert_eq!(record.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_cancelled_run_records_failed_with_transcription_settled() {
        let project = tempfile::tempdir().unwrap();
        let Some(input) = sample_video(project.path()) else {
            return;
        };
        let pipeline = StoryboardPipeline::new(test_config(), Arc::new(SilentEngine));
        let request = PipelineRequest {
            input,
            project_dir: project.path().join("project"),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run(request, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        let layout = ProjectLayout::new(&project.path().join("project"));
        let record: ProcessingRecord =
            serde_json::from_str(&std::fs::read_to_string(layout.record_path()).unwrap()).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.aborted_at, Some(Stage::SceneDetection));
        assert_eq!(record.step(Stage::Transcription).unwrap().status, StepStatus::Failed);
        assert!(!layout.artifact_dir.exists());
    }

    #[test]
    fn test_write_json_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis").join("scenes.json");
        write_json(&path, &Vec::<Scene>::new()).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "[]");
    }
}
