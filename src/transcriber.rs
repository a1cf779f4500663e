use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio_extractor::AudioExtractor;
use crate::error::{PipelineError, PipelineResult};
use crate::metadata::{SourceVideo, TranscriptSegment};
use crate::video_processor::{locate_program, wait_child};

/// Whisper 提供的模型规格
pub const WHISPER_MODELS: [&str; 5] = ["tiny", "base", "small", "medium", "large"];

/// 语音识别引擎
///
/// 由调用方构造一次后注入流水线，转录时只借用。
pub trait SpeechEngine: Send + Sync {
    /// 引擎名称，用于日志
    fn name(&self) -> &str;

    /// 转录一个音频文件；`language` 为空时自动识别语言，取消时尽快返回 `Cancelled`
    fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<TranscriptSegment>>;
}

/// 调用 whisper 命令行的引擎
#[derive(Debug, Clone)]
pub struct WhisperCliEngine {
    program: String,
    model: String,
}

/// whisper `--output_format json` 的输出
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: f64,
    #[serde(default)]
    no_speech_prob: f64,
}

impl WhisperCliEngine {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        if !WHISPER_MODELS.contains(&model.as_str()) {
            warn!("⚠️  [语音转录] 未知的 whisper 模型: {}，交由 whisper 自行校验", model);
        }
        Self {
            program: program.into(),
            model,
        }
    }

    fn command_args(&self, audio_path: &Path, output_dir: &Path, language: Option<&str>) -> Vec<String> {
        let mut args = vec![
            audio_path.to_string_lossy().to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--output_format".to_string(),
            "json".to_string(),
            "--output_dir".to_string(),
            output_dir.to_string_lossy().to_string(),
        ];
        if let Some(language) = language {
            args.push("--language".to_string());
            args.push(language.to_string());
        }
        args.push("--fp16".to_string());
        args.push("False".to_string());
        args
    }
}

impl SpeechEngine for WhisperCliEngine {
    fn name(&self) -> &str {
        "whisper"
    }

    fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<TranscriptSegment>> {
        let program = locate_program(&self.program)?;
        let output_dir = std::env::temp_dir().join(format!("storyboard-whisper-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&output_dir)?;
        let _cleanup = DirGuard(output_dir.clone());

        info!("⏳ [语音转录] 使用 whisper {} 模型转录: {}", self.model, audio_path.display());
        let child = Command::new(&program)
            .args(self.command_args(audio_path, &output_dir, language))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::TranscriptionFailed(format!("执行 whisper 失败: {}", e)))?;
        let output = wait_child(child, cancel)?;
        if !output.status.success() {
            return Err(PipelineError::TranscriptionFailed(format!(
                "whisper 退出状态 {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());
        let json_path = output_dir.join(format!("{}.json", stem));
        let content = std::fs::read_to_string(&json_path).map_err(|e| {
            PipelineError::TranscriptionFailed(format!("读取 whisper 输出失败: {} - {}", json_path.display(), e))
        })?;
        parse_whisper_json(&content)
    }
}

/// 目录守卫，Drop 时递归删除
struct DirGuard(PathBuf);

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            debug!("清理临时目录失败: {} - {}", self.0.display(), e);
        }
    }
}

fn parse_whisper_json(content: &str) -> PipelineResult<Vec<TranscriptSegment>> {
    let parsed: WhisperOutput = serde_json::from_str(content)
        .map_err(|e| PipelineError::TranscriptionFailed(format!("whisper 输出格式错误: {}", e)))?;
    info!(
        "🗣️  [语音转录] 识别语言: {}，片段数: {}",
        parsed.language.as_deref().unwrap_or("unknown"),
        parsed.segments.len()
    );
    Ok(parsed
        .segments
        .into_iter()
        .map(|s| TranscriptSegment {
            start: s.start,
            end: s.end,
            text: s.text,
            confidence: s.avg_logprob,
            no_speech_prob: s.no_speech_prob,
        })
        .collect())
}

/// 整理引擎输出：去掉空文本，按开始时间排序，裁掉与前一片段重叠的部分
pub fn normalize_segments(segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    let mut segments: Vec<TranscriptSegment> = segments
        .into_iter()
        .filter_map(|mut s| {
            s.text = s.text.trim().to_string();
            (!s.text.is_empty() && s.end > s.start).then_some(s)
        })
        .collect();
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut normalized: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());
    for mut segment in segments {
        if let Some(prev) = normalized.last() {
            if segment.start < prev.end {
                segment.start = prev.end;
            }
            if segment.start >= segment.end {
                debug!("丢弃被完全覆盖的转录片段: {:?}", segment.text);
                continue;
            }
        }
        normalized.push(segment);
    }
    normalized
}

/// 把片段裁到视频时长内，完全落在视频之后的片段丢弃
pub fn clamp_to_duration(segments: Vec<TranscriptSegment>, duration: f64) -> Vec<TranscriptSegment> {
    segments
        .into_iter()
        .filter_map(|mut s| {
            s.end = s.end.min(duration);
            (s.start < s.end).then_some(s)
        })
        .collect()
}

/// 语音转录器：提取音轨并交给注入的识别引擎
pub struct Transcriber {
    engine: Arc<dyn SpeechEngine>,
    ffmpeg_program: String,
}

impl Transcriber {
    pub fn new(engine: Arc<dyn SpeechEngine>, ffmpeg_program: impl Into<String>) -> Self {
        Self {
            engine,
            ffmpeg_program: ffmpeg_program.into(),
        }
    }

    /// 转录视频的音轨，没有音轨时返回空列表
    pub fn transcribe(
        &self,
        source: &SourceVideo,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<TranscriptSegment>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !source.has_audio {
            info!("🔇 [语音转录] 视频没有音轨，跳过转录: {}", source.path.display());
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let extractor = AudioExtractor::new(&source.path, self.ffmpeg_program.clone());
        let audio = extractor.extract_to_temp(cancel)?;
        let raw = self.engine.transcribe(audio.path(), language, cancel)?;
        let segments = clamp_to_duration(normalize_segments(raw), source.duration);

        info!(
            "✅ [语音转录] {} 完成，有效片段: {} 个，耗时: {:.2}秒",
            self.engine.name(),
            segments.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(segments)
    }
}
