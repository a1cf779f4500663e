use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::metadata::Scene;
use crate::stats_cache::StatsCache;
use crate::video_processor::VideoProcessor;

/// 场景检测模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// 基于相邻帧内容差异，适用于硬切
    #[default]
    Content,
    /// 基于亮度阈值检测淡入淡出
    Fade,
}

impl DetectorMode {
    /// 各模式的推荐默认阈值
    pub fn default_threshold(self) -> f64 {
        match self {
            DetectorMode::Content => 30.0,
            DetectorMode::Fade => 12.0,
        }
    }
}

impl FromStr for DetectorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "content" => Ok(DetectorMode::Content),
            "fade" | "threshold" => Ok(DetectorMode::Fade),
            other => Err(format!("不支持的检测模式: {}（可选 content / fade）", other)),
        }
    }
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorMode::Content => write!(f, "content"),
            DetectorMode::Fade => write!(f, "fade"),
        }
    }
}

/// 单帧指标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetric {
    pub frame: u64,
    pub timestamp: f64,
    /// 与上一帧的 HSV 平均差异（H 取 0-180，S/V 取 0-255）
    pub content_val: f64,
    /// 平均亮度 (0-255)
    pub mean_luma: f64,
}

/// 逐帧计算指标，保留上一帧的 HSV 数据用于求差
#[derive(Default)]
pub struct FrameAnalyzer {
    prev_hsv: Option<Vec<[f32; 3]>>,
}

impl FrameAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算一帧的 (content_val, mean_luma)
    pub fn analyze(&mut self, img: &RgbImage) -> (f64, f64) {
        let pixel_count = (img.width() as usize * img.height() as usize).max(1);
        let mut hsv = Vec::with_capacity(pixel_count);
        let mut intensity_sum = 0u64;

        for pixel in img.pixels() {
            let [r, g, b] = pixel.0;
            intensity_sum += r as u64 + g as u64 + b as u64;
            let (h, s, v) = rgb_to_hsv(r, g, b);
            // 与 OpenCV 8 位 HSV 的量纲保持一致
            hsv.push([(h / 2.0) as f32, (s * 255.0) as f32, (v * 255.0) as f32]);
        }
        let mean_luma = intensity_sum as f64 / (pixel_count as f64 * 3.0);

        let content_val = match &self.prev_hsv {
            Some(prev) if prev.len() == hsv.len() => {
                let mut delta = [0f64; 3];
                for (a, b) in prev.iter().zip(hsv.iter()) {
                    for c in 0..3 {
                        delta[c] += (a[c] - b[c]).abs() as f64;
                    }
                }
                delta.iter().sum::<f64>() / (3.0 * pixel_count as f64)
            }
            // 尺寸变化按完全不同处理
            Some(_) => 255.0,
            None => 0.0,
        };

        self.prev_hsv = Some(hsv);
        (content_val, mean_luma)
    }
}

/// RGB 转 HSV，返回 (色调 0-360, 饱和度 0-1, 亮度 0-1)
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

/// 场景检测器，用于检测视频中的镜头切换点
pub struct SceneDetector {
    /// 场景切换阈值（content 模式为内容差异，fade 模式为黑电平）
    threshold: f64,
    mode: DetectorMode,
    /// 两个切点之间的最小帧数
    min_scene_len: u64,
    /// 计算指标前将帧缩放到的宽度
    analysis_width: u32,
    cache: Option<StatsCache>,
}

impl SceneDetector {
    pub fn new(threshold: f64, mode: DetectorMode, min_scene_len: u64) -> Self {
        Self {
            threshold,
            mode,
            min_scene_len,
            analysis_width: 320,
            cache: None,
        }
    }

    pub fn with_analysis_width(mut self, width: u32) -> Self {
        self.analysis_width = width;
        self
    }

    pub fn with_cache(mut self, cache: StatsCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 检测视频的场景列表，保证首尾相接并覆盖整个视频
    pub fn detect(&self, processor: &VideoProcessor, cancel: &CancellationToken) -> PipelineResult<Vec<Scene>> {
        let start = Instant::now();
        info!(
            "⏳ [场景检测] 使用 {} 模式，阈值: {:.1}，最小场景长度: {} 帧",
            self.mode, self.threshold, self.min_scene_len
        );

        let metrics = self.collect_metrics(processor, cancel)?;
        let cuts = self.find_cuts(&metrics);
        let source = processor.source();
        let scenes = build_scenes(&cuts, metrics.len() as u64, source.fps, source.duration);
        if scenes.is_empty() {
            return Err(PipelineError::decode("视频没有可用的帧，无法划分场景"));
        }

        info!(
            "✅ [场景检测] 完成，检测到 {} 个场景，耗时: {:.2}秒",
            scenes.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(scenes)
    }

    /// 获取逐帧指标，启用缓存时优先读缓存
    pub fn collect_metrics(
        &self,
        processor: &VideoProcessor,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<FrameMetric>> {
        let path = &processor.source().path;
        let cache_key = match &self.cache {
            Some(_) => StatsCache::key_for(path, self.analysis_width)
                .map_err(|e| warn!("⚠️  [帧指标缓存] 无法计算缓存键: {}", e))
                .ok(),
            None => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(metrics) = cache.load(key, self.analysis_width) {
                return Ok(metrics);
            }
        }

        let mut analyzer = FrameAnalyzer::new();
        let mut metrics = Vec::new();
        processor.for_each_frame(self.analysis_width, cancel, |frame, timestamp, img| {
            let (content_val, mean_luma) = analyzer.analyze(img);
            metrics.push(FrameMetric {
                frame,
                timestamp,
                content_val,
                mean_luma,
            });
        })?;

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Err(e) = cache.store(key, self.analysis_width, &metrics) {
                warn!("⚠️  [帧指标缓存] 写入缓存失败: {}", e);
            }
        }
        Ok(metrics)
    }

    /// 根据逐帧指标找出切点（新场景的首帧帧号）
    pub fn find_cuts(&self, metrics: &[FrameMetric]) -> Vec<u64> {
        match self.mode {
            DetectorMode::Content => self.content_cuts(metrics),
            DetectorMode::Fade => self.fade_cuts(metrics),
        }
    }

    fn content_cuts(&self, metrics: &[FrameMetric]) -> Vec<u64> {
        let mut cuts = Vec::new();
        let mut last_cut = 0u64;
        for metric in metrics.iter().skip(1) {
            if metric.content_val > self.threshold && metric.frame - last_cut >= self.min_scene_len {
                cuts.push(metric.frame);
                last_cut = metric.frame;
            }
        }
        cuts
    }

    fn fade_cuts(&self, metrics: &[FrameMetric]) -> Vec<u64> {
        let mut cuts = Vec::new();
        let mut last_cut = 0u64;
        // 最近一次淡出的帧号；None 表示当前处于亮画面
        let mut fade_out: Option<u64> = None;
        // 视频以黑场开头时，第一次淡入不算切点
        let mut leading_black = false;

        for (i, metric) in metrics.iter().enumerate() {
            let below = metric.mean_luma < self.threshold;
            if i == 0 {
                if below {
                    fade_out = Some(metric.frame);
                    leading_black = true;
                }
                continue;
            }
            match (fade_out, below) {
                (None, true) => fade_out = Some(metric.frame),
                (Some(out_frame), false) => {
                    let split = (out_frame + metric.frame) / 2;
                    if !leading_black && split > last_cut && split - last_cut >= self.min_scene_len {
                        cuts.push(split);
                        last_cut = split;
                    }
                    leading_black = false;
                    fade_out = None;
                }
                _ => {}
            }
        }
        cuts
    }
}

/// 将切点帧号转换为首尾相接的场景列表
///
/// 第一个场景从 0 开始，最后一个场景在 `duration` 结束，相邻场景共享边界。
pub fn build_scenes(cuts: &[u64], frame_count: u64, fps: f64, duration: f64) -> Vec<Scene> {
    if frame_count == 0 || fps <= 0.0 || duration <= 0.0 {
        return Vec::new();
    }

    let mut boundaries: Vec<u64> = cuts
        .iter()
        .copied()
        .filter(|&c| c > 0 && c < frame_count && (c as f64 / fps) < duration)
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries.insert(0, 0);
    boundaries.push(frame_count);

    boundaries
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let is_last = i + 2 == boundaries.len();
            let start_time = pair[0] as f64 / fps;
            let end_time = if is_last { duration } else { pair[1] as f64 / fps };
            Scene {
                scene_id: i as u32 + 1,
                start_time,
                end_time,
                duration: end_time - start_time,
                start_frame: pair[0],
                end_frame: pair[1],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn solid(value: [u8; 3]) -> RgbImage {
        ImageBuffer::from_fn(32, 18, |_, _| Rgb(value))
    }

    fn metrics_from(values: &[(f64, f64)]) -> Vec<FrameMetric> {
        values
            .iter()
            .enumerate()
            .map(|(i, &(content_val, mean_luma))| FrameMetric {
                frame: i as u64,
                timestamp: i as f64 / 25.0,
                content_val,
                mean_luma,
            })
            .collect()
    }

    fn assert_contiguous(scenes: &[Scene], duration: f64) {
        assert_eq!(scenes[0].start_time, 0.0);
        for pair in scenes.windows(2) {
            assert!((pair[0].end_time - pair[1].start_time).abs() < 1e-9);
            assert_eq!(pair[0].end_frame, pair[1].start_frame);
        }
        assert!((scenes.last().unwrap().end_time - duration).abs() < 1e-9);
    }

    #[test]
    fn test_frame_difference() {
        let mut analyzer = FrameAnalyzer::new();
        let (first, _) = analyzer.analyze(&solid([100, 100, 100]));
        assert_eq!(first, 0.0);

        let (same, _) = analyzer.analyze(&solid([100, 100, 100]));
        assert_eq!(same, 0.0);

        // 灰色变为纯红：色调不变(0)，饱和度 0→255，亮度 100→255
        let (diff, luma) = analyzer.analyze(&solid([255, 0, 0]));
        assert!(diff > 100.0, "diff = {}", diff);
        assert!((luma - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_scenes_from_cuts_scenario() {
        // 120 秒、25 fps 的视频，在 40s 与 90s 处切换
        let scenes = build_scenes(&[1000, 2250], 3000, 25.0, 120.0);
        let windows: Vec<(f64, f64)> = scenes.iter().map(|s| (s.start_time, s.end_time)).collect();
        assert_eq!(windows, vec![(0.0, 40.0), (40.0, 90.0), (90.0, 120.0)]);
        assert_eq!(scenes[1].scene_id, 2);
        assert_eq!(scenes[1].duration, 50.0);
        assert_contiguous(&scenes, 120.0);
    }

    #[test]
    fn test_build_scenes_without_cuts_covers_whole_video() {
        let scenes = build_scenes(&[], 250, 25.0, 10.04);
        assert_eq!(scenes.len(), 1);
        assert_contiguous(&scenes, 10.04);
    }

    #[test]
    fn test_build_scenes_drops_out_of_range_and_duplicate_cuts() {
        let scenes = build_scenes(&[0, 50, 50, 400, 100], 200, 25.0, 8.0);
        assert_eq!(scenes.len(), 3);
        assert_eq!(scenes[1].start_frame, 50);
        assert_eq!(scenes[2].start_frame, 100);
        assert_contiguous(&scenes, 8.0);
    }

    #[test]
    fn test_content_cuts_respect_threshold_and_min_len() {
        let detector = SceneDetector::new(30.0, DetectorMode::Content, 3);
        let metrics = metrics_from(&[
            (0.0, 100.0),
            (2.0, 100.0),
            (45.0, 100.0), // 距起点只有 2 帧，被最小长度抑制
            (1.0, 100.0),
            (31.0, 100.0),
            (40.0, 100.0), // 距上一个切点不足 3 帧
            (0.5, 100.0),
            (29.9, 100.0), // 低于阈值
            (30.0, 100.0), // 等于阈值不算超过
            (30.5, 100.0),
        ]);
        assert_eq!(detector.find_cuts(&metrics), vec![4, 9]);
    }

    #[test]
    fn test_lower_threshold_is_more_sensitive() {
        let metrics = metrics_from(&[(0.0, 0.0), (0.0, 0.0), (20.0, 0.0), (0.0, 0.0), (0.0, 0.0), (40.0, 0.0)]);
        let strict = SceneDetector::new(30.0, DetectorMode::Content, 1);
        let loose = SceneDetector::new(15.0, DetectorMode::Content, 1);
        assert_eq!(strict.find_cuts(&metrics), vec![5]);
        assert_eq!(loose.find_cuts(&metrics), vec![2, 5]);
    }

    #[test]
    fn test_fade_cut_at_midpoint_of_black() {
        let detector = SceneDetector::new(12.0, DetectorMode::Fade, 2);
        let mut values = vec![(0.0, 120.0); 10];
        // 10..14 为黑场，14 帧淡入
        values.extend(vec![(0.0, 3.0); 4]);
        values.extend(vec![(0.0, 110.0); 6]);
        let metrics = metrics_from(&values);
        assert_eq!(detector.find_cuts(&metrics), vec![12]);

        let scenes = build_scenes(&detector.find_cuts(&metrics), 20, 25.0, 0.8);
        assert_eq!(scenes.len(), 2);
        assert_contiguous(&scenes, 0.8);
    }

    #[test]
    fn test_leading_black_does_not_cut() {
        let detector = SceneDetector::new(12.0, DetectorMode::Fade, 1);
        let mut values = vec![(0.0, 2.0); 5];
        values.extend(vec![(0.0, 150.0); 10]);
        assert!(detector.find_cuts(&metrics_from(&values)).is_empty());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Content".parse::<DetectorMode>().unwrap(), DetectorMode::Content);
        assert_eq!("threshold".parse::<DetectorMode>().unwrap(), DetectorMode::Fade);
        assert!("histogram".parse::<DetectorMode>().is_err());
        assert_eq!(DetectorMode::Fade.default_threshold(), 12.0);
    }
}
