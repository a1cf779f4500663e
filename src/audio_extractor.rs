use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::video_processor::run_ffmpeg;

/// 语音识别使用的采样率
pub const TRANSCRIBE_SAMPLE_RATE: u32 = 16_000;

/// 临时音频文件，离开作用域时删除（包括出错返回的路径）
#[derive(Debug)]
pub struct TempAudio {
    path: PathBuf,
}

impl TempAudio {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempAudio {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("已删除临时音频: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️  [音频提取] 删除临时音频失败: {} - {}", self.path.display(), e),
        }
    }
}

/// 音频提取器，从视频中提取音频
pub struct AudioExtractor {
    input_path: PathBuf,
    ffmpeg_program: String,
}

impl AudioExtractor {
    pub fn new(input_path: impl AsRef<Path>, ffmpeg_program: impl Into<String>) -> Self {
        Self {
            input_path: input_path.as_ref().to_path_buf(),
            ffmpeg_program: ffmpeg_program.into(),
        }
    }

    /// 提取为 16kHz 单声道 WAV，写入系统临时目录
    pub fn extract_to_temp(&self, cancel: &CancellationToken) -> PipelineResult<TempAudio> {
        let path = std::env::temp_dir().join(format!("storyboard-audio-{}.wav", Uuid::new_v4()));
        // 先建好守卫，提取失败时 ffmpeg 留下的半截文件也会被删掉
        let temp = TempAudio::new(path);
        self.extract_to_file(temp.path(), cancel)?;
        Ok(temp)
    }

    /// 提取音频到指定文件
    pub fn extract_to_file(&self, output_path: impl AsRef<Path>, cancel: &CancellationToken) -> PipelineResult<()> {
        let start = Instant::now();
        let output_path = output_path.as_ref();
        run_ffmpeg(&self.ffmpeg_program, wav_args(&self.input_path, output_path), cancel)?;
        info!(
            "✅ [音频提取] 已提取 {} → {}，耗时: {:.2}秒",
            self.input_path.display(),
            output_path.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

/// ffmpeg 参数：去掉视频，重采样为 16kHz 单声道 PCM
fn wav_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-vn".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-ar".to_string(),
        TRANSCRIBE_SAMPLE_RATE.to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}
