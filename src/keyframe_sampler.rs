use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::metadata::{Keyframe, Scene};
use crate::video_processor::VideoProcessor;

/// 按场景时长决定关键帧数量：< 2s 取 3 张，< 5s 取 4 张，其余 5 张
pub fn keyframe_count(duration: f64) -> usize {
    if duration < 2.0 {
        3
    } else if duration < 5.0 {
        4
    } else {
        5
    }
}

/// 在 `[start, end]` 内均匀取 `count` 个时间点（含两端），只取 1 个时取中点
pub fn sample_timestamps(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start + (end - start) / 2.0],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// 关键帧文件名，重复采样时覆盖同名文件
pub fn keyframe_filename(scene_id: u32, keyframe_index: u32) -> String {
    format!("scene_{}_keyframe_{}.jpg", scene_id, keyframe_index)
}

/// 关键帧采样器，把每个场景的代表帧保存为 JPEG
pub struct KeyframeSampler {
    output_dir: PathBuf,
}

impl KeyframeSampler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 为每个场景采样关键帧，按场景顺序返回
    ///
    /// 单帧解码或保存失败只记录警告并跳过，某个场景可能只有部分关键帧。
    pub fn sample(
        &self,
        processor: &VideoProcessor,
        scenes: &[Scene],
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Keyframe>> {
        let start = Instant::now();
        std::fs::create_dir_all(&self.output_dir)?;
        info!("⏳ [关键帧] 正在为 {} 个场景采样关键帧...", scenes.len());

        let source = processor.source();
        let mut reader = processor.frame_reader()?;
        let mut keyframes = Vec::new();
        let mut skipped = 0usize;

        for scene in scenes {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let timestamps = sample_timestamps(
                scene.start_time,
                scene.end_time,
                keyframe_count(scene.duration),
            );

            for (i, timestamp) in timestamps.into_iter().enumerate() {
                let keyframe_index = i as u32 + 1;
                let target = source.frame_at(timestamp);
                let filename = keyframe_filename(scene.scene_id, keyframe_index);
                let path = self.output_dir.join(&filename);

                let saved = reader
                    .read_frame(target)
                    .and_then(|(frame_number, img)| {
                        img.save(&path)?;
                        Ok(frame_number)
                    });
                match saved {
                    Ok(frame_number) => {
                        debug!(
                            "💾 [关键帧] 已保存 {} (场景 {}, 时间: {:.2}s, 帧: {})",
                            filename, scene.scene_id, timestamp, frame_number
                        );
                        keyframes.push(Keyframe {
                            scene_id: scene.scene_id,
                            keyframe_index,
                            timestamp,
                            frame_number,
                            filename,
                            path,
                        });
                    }
                    Err(e) => {
                        skipped += 1;
                        warn!(
                            "⚠️  [关键帧] 场景 {} 第 {} 帧 ({:.2}s) 采样失败，跳过: {}",
                            scene.scene_id, keyframe_index, timestamp, e
                        );
                    }
                }
            }
        }

        info!(
            "✅ [关键帧] 采样完成，保存 {} 张，跳过 {} 张，耗时: {:.2}秒",
            keyframes.len(),
            skipped,
            start.elapsed().as_secs_f64()
        );
        Ok(keyframes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_count_buckets() {
        let cases = [(1.0, 3), (1.9, 3), (2.0, 4), (4.9, 4), (5.0, 5), (50.0, 5)];
        for (duration, expected) in cases {
            assert_eq!(keyframe_count(duration), expected, "duration = {}", duration);
        }
    }

    #[test]
    fn test_timestamps_span_both_endpoints() {
        // 40s~90s 的中间场景
        let ts = sample_timestamps(40.0, 90.0, keyframe_count(50.0));
        assert_eq!(ts, vec![40.0, 52.5, 65.0, 77.5, 90.0]);
    }

    #[test]
    fn test_single_sample_is_midpoint() {
        assert_eq!(sample_timestamps(2.0, 4.0, 1), vec![3.0]);
        assert!(sample_timestamps(2.0, 4.0, 0).is_empty());
    }

    #[test]
    fn test_end_timestamp_maps_to_last_frame() {
        let source = crate::metadata::SourceVideo {
            path: PathBuf::from("in.mp4"),
            duration: 120.0,
            fps: 25.0,
            frame_count: 3000,
            width: 1920,
            height: 1080,
            has_audio: true,
        };
        assert_eq!(source.frame_at(120.0), 2999);
        assert_eq!(source.frame_at(52.5), 1313);
    }

    #[test]
    fn test_filename_is_deterministic() {
        assert_eq!(keyframe_filename(2, 5), "scene_2_keyframe_5.jpg");
    }
}
