use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::metadata::{Scene, TimeWindow, TranscriptSegment};
use crate::storyboard::{EntrySeed, StoryboardEntry, UnresolvedReason, WindowResolution};

/// 把上游分镜与检测出的场景、转录对齐，是唯一构造 `StoryboardEntry` 的地方
#[derive(Debug, Clone)]
pub struct Aligner {
    /// 未解析分镜的名义时长（秒）
    default_duration: f64,
}

impl Aligner {
    pub fn new(default_duration: f64) -> Self {
        Self { default_duration }
    }

    /// 对齐分镜种子
    ///
    /// 时间窗口的取法依次为：合法的显式窗口；匹配场景的窗口；都没有则标记为未解析。
    /// 显式窗口不合法时不会退回到场景窗口，但仍保留匹配到的场景，供合成时挑选关键帧。
    pub fn align(
        &self,
        source_duration: f64,
        scenes: &[Scene],
        transcript: &[TranscriptSegment],
        seeds: &[EntrySeed],
    ) -> Vec<StoryboardEntry> {
        // 上一个分镜的名义结束时间，未解析分镜以它为锚点
        let mut cursor = 0.0;
        let mut unresolved = 0usize;

        let entries: Vec<StoryboardEntry> = seeds
            .iter()
            .enumerate()
            .map(|(position, seed)| {
                let index = position + 1;
                let scene = match_scene(scenes, seed, position);
                let scene_id = scene.map(|s| s.scene_id);

                let resolution = match seed.explicit_window() {
                    Some(window) if window.is_within(source_duration) => WindowResolution::Explicit { window },
                    Some(window) => {
                        let err = PipelineError::InvalidTimeWindow {
                            start: window.start,
                            end: window.end,
                            duration: source_duration,
                        };
                        warn!("⚠️  [对齐] 分镜 {}: {}，改用回退合成", index, err);
                        WindowResolution::Unresolved {
                            reason: UnresolvedReason::InvalidTimeWindow,
                            anchor: cursor,
                            requested: Some(window),
                        }
                    }
                    None => match scene {
                        Some(scene) => WindowResolution::Scene { window: scene.window() },
                        None => WindowResolution::Unresolved {
                            reason: UnresolvedReason::NoWindow,
                            anchor: cursor,
                            requested: None,
                        },
                    },
                };

                cursor = match resolution {
                    WindowResolution::Explicit { window } | WindowResolution::Scene { window } => window.end,
                    WindowResolution::Unresolved { anchor, .. } => {
                        unresolved += 1;
                        anchor + self.default_duration
                    }
                };

                let dialogue = match resolution {
                    WindowResolution::Explicit { window } | WindowResolution::Scene { window } => {
                        aggregate_dialogue(&window, transcript)
                    }
                    WindowResolution::Unresolved { .. } => String::new(),
                };
                debug!("分镜 {}: {:?}, 场景 {:?}, 台词 {} 字", index, resolution, scene_id, dialogue.chars().count());

                StoryboardEntry {
                    index,
                    resolution,
                    scene_id,
                    dialogue,
                    metadata: seed.metadata.clone(),
                }
            })
            .collect();

        info!(
            "✅ [对齐] 完成，分镜 {} 个（未解析 {} 个），场景 {} 个，转录片段 {} 个",
            entries.len(),
            unresolved,
            scenes.len(),
            transcript.len()
        );
        entries
    }
}

/// 显式引用且存在的场景优先，否则按位置匹配第 i 个场景
fn match_scene<'a>(scenes: &'a [Scene], seed: &EntrySeed, position: usize) -> Option<&'a Scene> {
    if let Some(id) = seed.scene_id {
        if let Some(scene) = scenes.iter().find(|s| s.scene_id == id) {
            return Some(scene);
        }
        debug!("引用的场景 {} 不存在，按位置匹配", id);
    }
    scenes.get(position)
}

/// 没有上游分镜时，每个场景生成一个空种子
pub fn seeds_from_scenes(scenes: &[Scene]) -> Vec<EntrySeed> {
    scenes
        .iter()
        .map(|s| EntrySeed {
            scene_id: Some(s.scene_id),
            ..Default::default()
        })
        .collect()
}

/// 按时间顺序拼接与窗口相交的转录文本（部分重叠也算）
pub fn aggregate_dialogue(window: &TimeWindow, transcript: &[TranscriptSegment]) -> String {
    let mut hits: Vec<&TranscriptSegment> = transcript
        .iter()
        .filter(|seg| window.intersects(seg.start, seg.end))
        .collect();
    hits.sort_by(|a, b| a.start.total_cmp(&b.start));
    hits.iter()
        .map(|seg| seg.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
