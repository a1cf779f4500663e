use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::metadata::TimeWindow;

/// 分镜的作者元数据：固定几个常用字段，其余字段原样放进 `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novel_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_effects: Option<String>,
    /// 不解析的附加字段
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 上游生成的分镜种子记录（内容由外部生成，这里只关心时间窗口和场景引用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntrySeed {
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub scene_id: Option<u32>,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
}

impl EntrySeed {
    /// 两端都给出时才算显式窗口
    pub fn explicit_window(&self) -> Option<TimeWindow> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(TimeWindow::new(start, end)),
            _ => None,
        }
    }
}

/// 分镜时间窗口无法解析的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// 显式窗口违反 `0 <= start < end <= duration`
    InvalidTimeWindow,
    /// 既没有显式窗口也没有匹配的场景
    NoWindow,
}

/// 时间窗口的来源
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowResolution {
    /// 作者显式给出的窗口
    Explicit { window: TimeWindow },
    /// 取自匹配场景
    Scene { window: TimeWindow },
    /// 未解析，交给剪辑合成的回退路径；`anchor` 为名义起点
    Unresolved {
        reason: UnresolvedReason,
        anchor: f64,
        /// 作者给出但不在原视频范围内的窗口，配音音轨仍按它截取
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested: Option<TimeWindow>,
    },
}

/// 最终的分镜条目（仅由 Aligner 构造）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardEntry {
    /// 在列表中的位置（从 1 开始），也是产物文件名的编号
    pub index: usize,
    pub resolution: WindowResolution,
    /// 匹配到的场景编号（窗口无效时仍保留，用于挑选关键帧）
    pub scene_id: Option<u32>,
    /// 与窗口相交的转录文本
    pub dialogue: String,
    pub metadata: EntryMetadata,
}

impl StoryboardEntry {
    /// 已解析的时间窗口
    pub fn window(&self) -> Option<TimeWindow> {
        match self.resolution {
            WindowResolution::Explicit { window } | WindowResolution::Scene { window } => {
                Some(window)
            }
            WindowResolution::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.window().is_some()
    }

    /// 截取配音用的区间：已解析的窗口，否则为作者给出的原始窗口
    pub fn narration_window(&self) -> Option<TimeWindow> {
        match self.resolution {
            WindowResolution::Explicit { window } | WindowResolution::Scene { window } => Some(window),
            WindowResolution::Unresolved { requested, .. } => requested,
        }
    }
}

/// 剪辑来源方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    OriginalCrop,
    ImageFallback,
}

/// 合成出的分镜视频
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledClip {
    pub index: usize,
    pub path: PathBuf,
    /// 实际时长（秒）
    pub duration: f64,
    pub source_mode: SourceMode,
    pub generated_at: String,
}

/// 产物文件的规范名前缀，`storyboard_{index}`
pub fn artifact_stem(index: usize) -> String {
    format!("storyboard_{}", index)
}
