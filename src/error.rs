use std::path::PathBuf;
use thiserror::Error;

/// 流水线内部统一的结果类型
pub type PipelineResult<T> = Result<T, PipelineError>;

/// 流水线错误分类
///
/// 场景检测 / 转录失败只影响本阶段；剪辑合成失败只影响单个分镜；
/// 重建产物目录失败则整个保存操作失败，需要整体重试。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("源视频不存在: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("视频解码失败: {message}")]
    DecodeFailure { message: String },

    #[error("时间窗口无效: start={start:.3}s, end={end:.3}s, 视频时长={duration:.3}s")]
    InvalidTimeWindow { start: f64, end: f64, duration: f64 },

    #[error("分镜 {index} 没有可用的关键帧")]
    NoKeyframesAvailable { index: usize },

    #[error("视频编码失败: {message}")]
    EncodeFailure {
        message: String,
        stderr: Option<String>,
    },

    #[error("产物目录重建失败（{phase} 阶段）: {source}")]
    ReconciliationIo {
        phase: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("外部引擎不可用: {0}")]
    EngineUnavailable(String),

    #[error("语音转录失败: {0}")]
    TranscriptionFailed(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("后台任务异常: {0}")]
    TaskFailed(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::DecodeFailure {
            message: message.into(),
        }
    }

    pub fn encode(message: impl Into<String>, stderr: Option<String>) -> Self {
        Self::EncodeFailure {
            message: message.into(),
            stderr,
        }
    }

    pub fn reconcile(phase: &'static str, source: std::io::Error) -> Self {
        Self::ReconciliationIo { phase, source }
    }

    /// 产物目录重建是幂等的，失败后可以原样重试整个调用
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReconciliationIo { .. })
    }
}

impl From<ffmpeg_next::Error> for PipelineError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::decode(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reconciliation_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(PipelineError::reconcile("commit", io).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::NoKeyframesAvailable { index: 2 }.is_retryable());
    }

    #[test]
    fn test_invalid_window_message() {
        let err = PipelineError::InvalidTimeWindow {
            start: 10.0,
            end: 8.0,
            duration: 120.0,
        };
        assert!(err.to_string().contains("start=10.000s"));
    }
}
