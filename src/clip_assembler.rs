use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::metadata::{Keyframe, SourceVideo, TimeWindow};
use crate::storyboard::{artifact_stem, AssembledClip, SourceMode, StoryboardEntry};
use crate::video_processor::{has_audio_stream, probe_duration, run_ffmpeg};

/// 剪辑合成参数
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    /// 回退路径没有配音时的画面时长（秒）
    pub default_duration: f64,
    /// 输出帧率
    pub fps: u32,
    /// 回退画面的画布尺寸
    pub width: u32,
    pub height: u32,
    /// 输出视频编码器
    pub video_codec: String,
    pub ffmpeg_program: String,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            default_duration: 3.0,
            fps: 24,
            width: 1920,
            height: 1080,
            video_codec: "libx264".to_string(),
            ffmpeg_program: "ffmpeg".to_string(),
        }
    }
}

/// 单独生成的配音音轨（有自己的时间轴），只用于回退路径
#[derive(Debug, Clone)]
pub struct NarrationTrack {
    pub path: PathBuf,
    pub duration: f64,
}

impl NarrationTrack {
    pub fn new(path: impl Into<PathBuf>, duration: f64) -> Self {
        Self {
            path: path.into(),
            duration,
        }
    }

    /// 打开并探测音轨时长
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::SourceNotFound(path.to_path_buf()));
        }
        let duration = probe_duration(path)?;
        info!("🎙️  [剪辑合成] 配音音轨: {} ({:.2}s)", path.display(), duration);
        Ok(Self::new(path, duration))
    }

    /// 截取区间是否落在音轨范围内
    pub fn covers(&self, window: &TimeWindow) -> bool {
        window.is_within(self.duration)
    }
}

/// 配音截取
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCut {
    pub path: PathBuf,
    pub window: TimeWindow,
}

/// 单个分镜的合成方案
#[derive(Debug, Clone, PartialEq)]
pub enum ClipPlan {
    /// 从原视频裁剪，保留原音轨
    OriginalCrop { source: PathBuf, window: TimeWindow },
    /// 关键帧静帧 + 可选配音
    ImageFallback {
        image: PathBuf,
        scene_id: u32,
        hold: f64,
        audio: Option<AudioCut>,
    },
}

impl ClipPlan {
    pub fn source_mode(&self) -> SourceMode {
        match self {
            ClipPlan::OriginalCrop { .. } => SourceMode::OriginalCrop,
            ClipPlan::ImageFallback { .. } => SourceMode::ImageFallback,
        }
    }

    /// 预期的输出时长
    pub fn expected_duration(&self) -> f64 {
        match self {
            ClipPlan::OriginalCrop { window, .. } => window.duration(),
            ClipPlan::ImageFallback { hold, .. } => *hold,
        }
    }
}

/// 参与拼接的分镜视频
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeInput {
    pub path: PathBuf,
    pub duration: f64,
    pub has_audio: bool,
}

/// 单个分镜的合成结果，失败不影响其他分镜
#[derive(Debug)]
pub struct ClipOutcome {
    pub index: usize,
    pub result: PipelineResult<AssembledClip>,
}

/// 剪辑合成器，按分镜序号把视频写到渲染目录
pub struct ClipAssembler {
    settings: AssemblerSettings,
    render_dir: PathBuf,
}

impl ClipAssembler {
    pub fn new(settings: AssemblerSettings, render_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            render_dir: render_dir.into(),
        }
    }

    pub fn render_dir(&self) -> &Path {
        &self.render_dir
    }

    /// 决定合成方式（不做任何 IO）
    pub fn plan(
        &self,
        entry: &StoryboardEntry,
        source: Option<&SourceVideo>,
        keyframes: &[Keyframe],
        narration: Option<&NarrationTrack>,
    ) -> PipelineResult<ClipPlan> {
        if let (Some(window), Some(source)) = (entry.window(), source) {
            if source.contains_window(&window) {
                return Ok(ClipPlan::OriginalCrop {
                    source: source.path.clone(),
                    window,
                });
            }
        }

        let keyframe = select_keyframe(entry, keyframes).ok_or(PipelineError::NoKeyframesAvailable { index: entry.index })?;

        // 配音区间合法时画面时长跟随配音，否则用默认时长且不带音轨。
        // 超出原视频范围的作者窗口仍可能落在配音音轨内
        let audio = match (entry.narration_window(), narration) {
            (Some(window), Some(track)) if track.covers(&window) => Some(AudioCut {
                path: track.path.clone(),
                window,
            }),
            (Some(window), Some(track)) => {
                debug!(
                    "分镜 {} 的区间 [{:.2}, {:.2}] 超出配音时长 {:.2}s，不带音轨",
                    entry.index, window.start, window.end, track.duration
                );
                None
            }
            _ => None,
        };
        let hold = audio
            .as_ref()
            .map(|cut| cut.window.duration())
            .unwrap_or(self.settings.default_duration);

        Ok(ClipPlan::ImageFallback {
            image: keyframe.path.clone(),
            scene_id: keyframe.scene_id,
            hold,
            audio,
        })
    }

    /// 执行合成方案，输出 `storyboard_{index}.mp4`
    pub fn render(&self, index: usize, plan: &ClipPlan, cancel: &CancellationToken) -> PipelineResult<AssembledClip> {
        std::fs::create_dir_all(&self.render_dir)?;
        let output = self.render_dir.join(format!("{}.mp4", artifact_stem(index)));

        match plan {
            ClipPlan::OriginalCrop { source, window } => {
                let copy_audio = crop_args(&self.settings, source, window, &output, AudioCodec::Copy);
                match run_ffmpeg(&self.settings.ffmpeg_program, &copy_audio, cancel) {
                    Ok(()) => {}
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e) => {
                        // 原音轨无法直接复制进 MP4 时重新编码为 AAC
                        warn!("⚠️  [剪辑合成] 分镜 {} 复制音轨失败，改为 AAC 重新编码: {}", index, e);
                        let reencode = crop_args(&self.settings, source, window, &output, AudioCodec::Aac);
                        run_ffmpeg(&self.settings.ffmpeg_program, &reencode, cancel)?;
                    }
                }
            }
            ClipPlan::ImageFallback { image, hold, audio, .. } => {
                let args = still_args(&self.settings, image, *hold, audio.as_ref(), &output);
                run_ffmpeg(&self.settings.ffmpeg_program, &args, cancel)?;
            }
        }

        let expected = plan.expected_duration();
        let duration = probe_duration(&output).unwrap_or_else(|e| {
            warn!("⚠️  [剪辑合成] 无法探测 {} 的时长，按预期时长记录: {}", output.display(), e);
            expected
        });
        if (duration - expected).abs() > 0.05 {
            warn!(
                "⚠️  [剪辑合成] 分镜 {} 实际时长 {:.3}s 与预期 {:.3}s 偏差较大",
                index, duration, expected
            );
        }

        Ok(AssembledClip {
            index,
            path: output,
            duration,
            source_mode: plan.source_mode(),
            generated_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// 合成单个分镜
    pub fn assemble(
        &self,
        entry: &StoryboardEntry,
        source: Option<&SourceVideo>,
        keyframes: &[Keyframe],
        narration: Option<&NarrationTrack>,
        cancel: &CancellationToken,
    ) -> PipelineResult<AssembledClip> {
        let plan = self.plan(entry, source, keyframes, narration)?;
        match &plan {
            ClipPlan::OriginalCrop { window, .. } => debug!(
                "分镜 {}: 裁剪原视频 [{:.2}, {:.2}]",
                entry.index, window.start, window.end
            ),
            ClipPlan::ImageFallback { image, hold, audio, .. } => debug!(
                "分镜 {}: 静帧 {} 持续 {:.2}s，配音: {}",
                entry.index,
                image.display(),
                hold,
                audio.is_some()
            ),
        }
        self.render(entry.index, &plan, cancel)
    }

    /// 依次合成所有分镜，单个分镜失败只记录在对应结果里
    pub fn assemble_all(
        &self,
        entries: &[StoryboardEntry],
        source: Option<&SourceVideo>,
        keyframes: &[Keyframe],
        narration: Option<&NarrationTrack>,
        cancel: &CancellationToken,
    ) -> Vec<ClipOutcome> {
        let start = Instant::now();
        info!("⏳ [剪辑合成] 正在合成 {} 个分镜...", entries.len());

        let outcomes: Vec<ClipOutcome> = entries
            .iter()
            .map(|entry| {
                let result = if cancel.is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else {
                    self.assemble(entry, source, keyframes, narration, cancel)
                };
                match &result {
                    Ok(clip) => info!(
                        "🎬 [剪辑合成] 分镜 {} 完成: {:?}, {:.2}s",
                        clip.index, clip.source_mode, clip.duration
                    ),
                    Err(e) => error!("❌ [剪辑合成] 分镜 {} 失败: {}", entry.index, e),
                }
                ClipOutcome {
                    index: entry.index,
                    result,
                }
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(
            "✅ [剪辑合成] 完成 {}/{} 个分镜，耗时: {:.2}秒",
            succeeded,
            outcomes.len(),
            start.elapsed().as_secs_f64()
        );
        outcomes
    }

    /// 按顺序把分镜视频拼成一个完整视频
    ///
    /// 各分镜的分辨率和音轨可能不同（原视频裁剪或静帧），统一缩放到画布尺寸，
    /// 没有音轨的分镜补静音。
    pub fn compose(&self, clips: &[PathBuf], output: &Path, cancel: &CancellationToken) -> PipelineResult<PathBuf> {
        if clips.is_empty() {
            return Err(PipelineError::encode("没有可拼接的分镜视频", None));
        }
        let start = Instant::now();
        info!("⏳ [视频拼接] 正在拼接 {} 个分镜视频...", clips.len());

        let inputs = clips
            .iter()
            .map(|path| {
                Ok(ComposeInput {
                    path: path.clone(),
                    duration: probe_duration(path)?,
                    has_audio: has_audio_stream(path)?,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_ffmpeg(&self.settings.ffmpeg_program, compose_args(&self.settings, &inputs, output), cancel)?;

        let total: f64 = inputs.iter().map(|i| i.duration).sum();
        info!(
            "✅ [视频拼接] 完成: {} ({:.2}s)，耗时: {:.2}秒",
            output.display(),
            total,
            start.elapsed().as_secs_f64()
        );
        Ok(output.to_path_buf())
    }
}

/// 按优先级挑选回退画面：同场景的首张关键帧；分镜序号对应的关键帧；序号取模
pub fn select_keyframe<'a>(entry: &StoryboardEntry, keyframes: &'a [Keyframe]) -> Option<&'a Keyframe> {
    if keyframes.is_empty() {
        return None;
    }
    if let Some(scene_id) = entry.scene_id {
        let first_of_scene = keyframes
            .iter()
            .filter(|k| k.scene_id == scene_id)
            .min_by_key(|k| k.keyframe_index);
        if first_of_scene.is_some() {
            return first_of_scene;
        }
    }
    let position = entry.index.saturating_sub(1);
    keyframes.get(position).or_else(|| keyframes.get(position % keyframes.len()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AudioCodec {
    Copy,
    Aac,
}

fn secs(value: f64) -> String {
    format!("{:.3}", value)
}

fn crop_args(
    settings: &AssemblerSettings,
    source: &Path,
    window: &TimeWindow,
    output: &Path,
    audio: AudioCodec,
) -> Vec<String> {
    let mut args = vec![
        "-ss".to_string(),
        secs(window.start),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-t".to_string(),
        secs(window.duration()),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-c:v".to_string(),
        settings.video_codec.clone(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ];
    match audio {
        AudioCodec::Copy => args.extend(["-c:a".to_string(), "copy".to_string()]),
        AudioCodec::Aac => args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
        ]),
    }
    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

fn still_args(
    settings: &AssemblerSettings,
    image: &Path,
    hold: f64,
    audio: Option<&AudioCut>,
    output: &Path,
) -> Vec<String> {
    let (w, h) = (settings.width, settings.height);
    let mut args = vec![
        "-loop".to_string(),
        "1".to_string(),
        "-framerate".to_string(),
        settings.fps.to_string(),
        "-i".to_string(),
        image.to_string_lossy().to_string(),
    ];
    if let Some(cut) = audio {
        args.extend([
            "-ss".to_string(),
            secs(cut.window.start),
            "-t".to_string(),
            secs(cut.window.duration()),
            "-i".to_string(),
            cut.path.to_string_lossy().to_string(),
        ]);
    }
    args.extend([
        "-map".to_string(),
        "0:v:0".to_string(),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,format=yuv420p"
        ),
        "-c:v".to_string(),
        settings.video_codec.clone(),
        "-r".to_string(),
        settings.fps.to_string(),
    ]);
    if audio.is_some() {
        args.extend([
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
        ]);
    } else {
        args.push("-an".to_string());
    }
    args.extend([
        "-t".to_string(),
        secs(hold),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// 拼接用的 ffmpeg 参数：逐个输入统一画布、帧率、音频格式后用 concat 滤镜串起来
fn compose_args(settings: &AssemblerSettings, inputs: &[ComposeInput], output: &Path) -> Vec<String> {
    const SAMPLE_RATE: u32 = 44_100;
    let (w, h, fps) = (settings.width, settings.height, settings.fps);

    let mut args = Vec::new();
    for input in inputs {
        args.push("-i".to_string());
        args.push(input.path.to_string_lossy().to_string());
    }

    let mut graph = String::new();
    let mut pairs = String::new();
    for (i, input) in inputs.iter().enumerate() {
        graph.push_str(&format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}];"
        ));
        if input.has_audio {
            graph.push_str(&format!(
                "[{i}:a]aresample={SAMPLE_RATE},aformat=sample_fmts=fltp:channel_layouts=stereo[a{i}];"
            ));
        } else {
            graph.push_str(&format!(
                "anullsrc=r={SAMPLE_RATE}:cl=stereo,atrim=duration={}[a{i}];",
                secs(input.duration)
            ));
        }
        pairs.push_str(&format!("[v{i}][a{i}]"));
    }
    graph.push_str(&format!("{pairs}concat=n={}:v=1:a=1[v][a]", inputs.len()));

    args.extend([
        "-filter_complex".to_string(),
        graph,
        "-map".to_string(),
        "[v]".to_string(),
        "-map".to_string(),
        "[a]".to_string(),
        "-c:v".to_string(),
        settings.video_codec.clone(),
        "-r".to_string(),
        fps.to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}
