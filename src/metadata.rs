use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 源视频的基础信息（只读输入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVideo {
    /// 视频文件路径
    pub path: PathBuf,
    /// 视频总时长（秒）
    pub duration: f64,
    /// 视频帧率
    pub fps: f64,
    /// 总帧数
    pub frame_count: u64,
    /// 分辨率宽
    pub width: u32,
    /// 分辨率高
    pub height: u32,
    /// 是否包含音频流
    pub has_audio: bool,
}

impl SourceVideo {
    /// 时间戳对应的帧号（四舍五入，并限制在最后一帧以内）
    pub fn frame_at(&self, timestamp: f64) -> u64 {
        let frame = (timestamp * self.fps).round().max(0.0) as u64;
        frame.min(self.frame_count.saturating_sub(1))
    }

    /// 判断时间窗口是否满足 `0 <= start < end <= duration`
    pub fn contains_window(&self, window: &TimeWindow) -> bool {
        window.is_within(self.duration)
    }
}

/// 半开时间窗口 `[start, end)`，单位秒
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_within(&self, total: f64) -> bool {
        self.start >= 0.0 && self.start < self.end && self.end <= total
    }

    /// 区间相交（部分重叠也算）
    pub fn intersects(&self, start: f64, end: f64) -> bool {
        start < self.end && end > self.start
    }
}

/// 单个场景（两个镜头切换点之间的连续时间段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// 场景编号（从 1 开始）
    pub scene_id: u32,
    /// 场景开始时间（秒）
    pub start_time: f64,
    /// 场景结束时间（秒）
    pub end_time: f64,
    /// 场景持续时间（秒）
    pub duration: f64,
    /// 起始帧号
    pub start_frame: u64,
    /// 结束帧号（不含）
    pub end_frame: u64,
}

impl Scene {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time)
    }
}

/// 场景关键帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyframe {
    /// 所属场景编号
    pub scene_id: u32,
    /// 场景内的采样序号（从 1 开始）
    pub keyframe_index: u32,
    /// 采样时间点（秒）
    pub timestamp: f64,
    /// 实际解码的帧号
    pub frame_number: u64,
    /// 关键帧图片文件名
    pub filename: String,
    /// 关键帧图片完整路径
    pub path: PathBuf,
}

/// 语音转录片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// 平均对数概率
    pub confidence: f64,
    pub no_speech_prob: f64,
}

/// 一次视频分析的完整结果（场景 + 关键帧 + 转录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAnalysis {
    pub source: SourceVideo,
    pub scenes: Vec<Scene>,
    pub keyframes: Vec<Keyframe>,
    pub transcript: Vec<TranscriptSegment>,
    /// 分析完成时间
    pub analyzed_at: String,
}
