use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Once;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::metadata::SourceVideo;

static FFMPEG_INIT: Once = Once::new();

/// 初始化 FFmpeg，并把日志级别压到 ERROR，抑制警告和信息消息
fn init_ffmpeg() -> PipelineResult<()> {
    let mut result = Ok(());
    FFMPEG_INIT.call_once(|| {
        result = ffmpeg::init().map_err(|e| PipelineError::decode(format!("初始化 FFmpeg 失败: {}", e)));
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }
    });
    result
}

/// 视频处理器，负责探测视频信息并解码帧
///
/// 每次解码都会单独打开一次输入上下文，解码结束（包括出错）时随作用域释放。
#[derive(Debug, Clone)]
pub struct VideoProcessor {
    source: SourceVideo,
}

impl VideoProcessor {
    /// 打开并探测视频文件
    pub fn open(input_path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = input_path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(PipelineError::SourceNotFound(path));
        }
        init_ffmpeg()?;

        let source = probe(&path)?;
        info!(
            "🎞️  [视频探测] {}: {:.2}s, {:.2} fps, {} 帧, {}x{}, 音频: {}",
            path.display(),
            source.duration,
            source.fps,
            source.frame_count,
            source.width,
            source.height,
            source.has_audio
        );
        Ok(Self { source })
    }

    pub fn source(&self) -> &SourceVideo {
        &self.source
    }

    /// 顺序解码全部视频帧，缩放到 `analysis_width` 宽后交给回调
    ///
    /// 回调参数为 (帧序号, 时间戳秒, RGB 图像)。返回实际解码的帧数。
    pub fn for_each_frame<F>(
        &self,
        analysis_width: u32,
        cancel: &CancellationToken,
        mut on_frame: F,
    ) -> PipelineResult<u64>
    where
        F: FnMut(u64, f64, &RgbImage),
    {
        let mut ictx = open_input(&self.source.path)?;
        let stream_index = best_video_stream(&ictx)?;
        let mut decoder = open_decoder(&ictx, stream_index)?;

        let (width, height) = scaled_size(decoder.width(), decoder.height(), analysis_width);
        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| PipelineError::decode(format!("无法创建缩放器: {}", e)))?;

        let fps = self.source.fps;
        let start = Instant::now();
        let mut frame_index = 0u64;

        let mut drain = |decoder: &mut ffmpeg::decoder::Video, frame_index: &mut u64| -> PipelineResult<()> {
            let mut decoded = ffmpeg::frame::Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| PipelineError::decode(format!("帧缩放失败: {}", e)))?;
                let img = frame_to_rgb(&rgb_frame);
                on_frame(*frame_index, *frame_index as f64 / fps, &img);
                *frame_index += 1;
            }
            Ok(())
        };

        for (stream, packet) in ictx.packets() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if stream.index() != stream_index {
                continue;
            }
            if let Err(e) = decoder.send_packet(&packet) {
                // 损坏的数据包直接跳过，不影响整体解码
                debug!("跳过无法解码的数据包: {}", e);
                continue;
            }
            drain(&mut decoder, &mut frame_index)?;
        }
        decoder.send_eof()?;
        drain(&mut decoder, &mut frame_index)?;

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            "✅ [视频解码] 顺序解码完成: {} 帧, 耗时 {:.2}s ({:.1} 帧/s)",
            frame_index,
            elapsed,
            frame_index as f64 / elapsed.max(0.001)
        );
        if frame_index == 0 {
            return Err(PipelineError::decode("没有解码出任何视频帧"));
        }
        Ok(frame_index)
    }

    /// 打开一个按帧号随机读取的读取器
    pub fn frame_reader(&self) -> PipelineResult<FrameReader> {
        FrameReader::new(&self.source)
    }
}

/// 按帧号随机读取原始分辨率帧，持有独占的输入句柄，Drop 时释放
pub struct FrameReader {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    fps: f64,
}

impl FrameReader {
    fn new(source: &SourceVideo) -> PipelineResult<Self> {
        let ictx = open_input(&source.path)?;
        let stream_index = best_video_stream(&ictx)?;
        let time_base = ictx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| PipelineError::decode("未找到视频流"))?;
        let decoder = open_decoder(&ictx, stream_index)?;
        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| PipelineError::decode(format!("无法创建缩放器: {}", e)))?;

        Ok(Self {
            ictx,
            decoder,
            scaler,
            stream_index,
            time_base,
            fps: source.fps,
        })
    }

    /// 解码最接近 `frame_number` 的帧，返回 (实际帧号, 图像)
    pub fn read_frame(&mut self, frame_number: u64) -> PipelineResult<(u64, DynamicImage)> {
        // 最多读取的数据包数，避免在损坏文件上无限读取
        const MAX_PACKETS_TO_READ: usize = 240;

        let target_time = frame_number as f64 / self.fps;
        let timestamp = (target_time * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        // 向后查找最近的 keyframe
        self.ictx
            .seek(timestamp, ..timestamp)
            .map_err(|e| PipelineError::decode(format!("跳转到帧 {} 失败: {}", frame_number, e)))?;
        self.decoder.flush();

        let tb = f64::from(self.time_base);
        let mut best: Option<(u64, ffmpeg::frame::Video)> = None;
        let mut packets_read = 0;

        'packets: for (stream, packet) in self.ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            packets_read += 1;
            if packets_read > MAX_PACKETS_TO_READ {
                break;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }

            let mut decoded = ffmpeg::frame::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let decoded_number = keep_closest(&mut best, &decoded, frame_number, tb, self.fps);
                if decoded_number >= frame_number {
                    break 'packets;
                }
            }
        }

        // 目标在文件末尾时，剩余帧还在解码器缓冲区里
        if best.as_ref().map(|(n, _)| *n < frame_number).unwrap_or(true) && self.decoder.send_eof().is_ok() {
            let mut decoded = ffmpeg::frame::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                keep_closest(&mut best, &decoded, frame_number, tb, self.fps);
            }
        }

        let (decoded_number, frame) =
            best.ok_or_else(|| PipelineError::decode(format!("帧 {} 无法解码", frame_number)))?;
        if decoded_number != frame_number {
            debug!("目标帧 {} 实际解码到帧 {}", frame_number, decoded_number);
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&frame, &mut rgb_frame)
            .map_err(|e| PipelineError::decode(format!("帧缩放失败: {}", e)))?;
        Ok((decoded_number, DynamicImage::ImageRgb8(frame_to_rgb(&rgb_frame))))
    }
}

/// 保留与目标帧号最接近的帧，返回当前帧的帧号
fn keep_closest(
    best: &mut Option<(u64, ffmpeg::frame::Video)>,
    decoded: &ffmpeg::frame::Video,
    target: u64,
    time_base: f64,
    fps: f64,
) -> u64 {
    let frame_time = decoded.timestamp().map(|ts| ts as f64 * time_base).unwrap_or(0.0);
    let number = (frame_time * fps).round().max(0.0) as u64;
    let closer = best
        .as_ref()
        .map(|(n, _)| number.abs_diff(target) < n.abs_diff(target))
        .unwrap_or(true);
    if closer {
        *best = Some((number, decoded.clone()));
    }
    number
}

/// 探测任意媒体文件的时长（秒），用于校验合成结果
pub fn probe_duration(path: impl AsRef<Path>) -> PipelineResult<f64> {
    init_ffmpeg()?;
    let ictx = open_input(path.as_ref())?;
    if ictx.duration() > 0 {
        return Ok(ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64);
    }
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .or_else(|| ictx.streams().best(ffmpeg::media::Type::Audio))
        .ok_or_else(|| PipelineError::decode(format!("{} 中没有媒体流", path.as_ref().display())))?;
    Ok(stream.duration() as f64 * f64::from(stream.time_base()))
}

/// 确认外部命令行工具可用，返回其完整路径
pub fn locate_program(program: &str) -> PipelineResult<PathBuf> {
    which::which(program).map_err(|e| PipelineError::EngineUnavailable(format!("{}: {}", program, e)))
}

/// 媒体文件是否带音频流
pub fn has_audio_stream(path: impl AsRef<Path>) -> PipelineResult<bool> {
    init_ffmpeg()?;
    let ictx = open_input(path.as_ref())?;
    let found = ictx.streams().best(ffmpeg::media::Type::Audio).is_some();
    Ok(found)
}

/// 子进程的退出状态和 stderr 输出
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

/// 等待子进程结束；取消时杀掉子进程并返回 `Cancelled`
///
/// stderr 需以 `Stdio::piped()` 启动，由单独线程读取，避免管道写满后子进程阻塞。
pub fn wait_child(mut child: Child, cancel: &CancellationToken) -> PipelineResult<ProcessOutput> {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    loop {
        if let Some(status) = child.try_wait()? {
            let stderr = stderr_reader
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            return Ok(ProcessOutput { status, stderr });
        }
        if cancel.is_cancelled() {
            if let Err(e) = child.kill() {
                warn!("⚠️  [子进程] 终止子进程失败: {}", e);
            }
            let _ = child.wait();
            return Err(PipelineError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// 以 `-loglevel error` 运行 ffmpeg 命令行，失败时带上 stderr；取消时终止 ffmpeg
pub fn run_ffmpeg<I, S>(program: &str, args: I, cancel: &CancellationToken) -> PipelineResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let child = Command::new(program)
        .arg("-loglevel")
        .arg("error")
        .arg("-nostdin")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::encode(format!("执行 {} 失败: {}", program, e), None))?;

    let output = wait_child(child, cancel)?;
    if !output.status.success() {
        let stderr = output.stderr.trim().to_string();
        return Err(PipelineError::encode(
            format!("{} 退出状态: {}", program, output.status),
            (!stderr.is_empty()).then_some(stderr),
        ));
    }
    Ok(())
}

fn probe(path: &Path) -> PipelineResult<SourceVideo> {
    let ictx = open_input(path)?;
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| PipelineError::decode("未找到视频流"))?;
    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| PipelineError::decode(format!("无法创建解码器上下文: {}", e)))?
        .decoder()
        .video()
        .map_err(|e| PipelineError::decode(format!("无法创建视频解码器: {}", e)))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        warn!("⚠️  [视频探测] 容器未给出帧率，按 30 fps 处理");
        30.0
    };

    let duration = if ictx.duration() > 0 {
        ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
    } else {
        stream.duration() as f64 * f64::from(stream.time_base())
    };
    if duration <= 0.0 {
        return Err(PipelineError::decode("无法确定视频时长"));
    }

    let frame_count = if stream.frames() > 0 {
        stream.frames() as u64
    } else {
        (duration * fps).round() as u64
    };

    Ok(SourceVideo {
        path: path.to_path_buf(),
        duration,
        fps,
        frame_count,
        width: decoder.width(),
        height: decoder.height(),
        has_audio: ictx.streams().best(ffmpeg::media::Type::Audio).is_some(),
    })
}

fn open_input(path: &Path) -> PipelineResult<ffmpeg::format::context::Input> {
    ffmpeg::format::input(&path)
        .map_err(|e| PipelineError::decode(format!("无法打开视频文件 {}: {}", path.display(), e)))
}

fn best_video_stream(ictx: &ffmpeg::format::context::Input) -> PipelineResult<usize> {
    ictx.streams()
        .best(ffmpeg::media::Type::Video)
        .map(|s| s.index())
        .ok_or_else(|| PipelineError::decode("未找到视频流"))
}

fn open_decoder(
    ictx: &ffmpeg::format::context::Input,
    stream_index: usize,
) -> PipelineResult<ffmpeg::decoder::Video> {
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| PipelineError::decode("未找到视频流"))?;
    ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| PipelineError::decode(format!("无法创建解码器上下文: {}", e)))?
        .decoder()
        .video()
        .map_err(|e| PipelineError::decode(format!("无法创建视频解码器: {}", e)))
}

/// 按目标宽度等比缩放，高度取偶数；原图更窄时不放大
pub fn scaled_size(width: u32, height: u32, target_width: u32) -> (u32, u32) {
    if width == 0 || height == 0 || target_width == 0 || width <= target_width {
        return (width, height);
    }
    let scaled_height = (height as u64 * target_width as u64 / width as u64) as u32;
    (target_width, (scaled_height.max(2) / 2) * 2)
}

/// 将 RGB24 的 FFmpeg 帧转换为 RgbImage（按行拷贝，跳过 stride 填充）
fn frame_to_rgb(frame: &ffmpeg::frame::Video) -> RgbImage {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = width as usize * 3;

    let mut buf = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let offset = y * stride;
        buf.extend_from_slice(&data[offset..offset + row_len]);
    }
    RgbImage::from_raw(width, height, buf).unwrap_or_else(|| RgbImage::new(width, height))
}
