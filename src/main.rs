use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use video_storyboard::reconciler::EntryRecord;
use video_storyboard::{
    ArtifactReconciler, AssembledClip, ConfigLoader, ConfigOverrides, DetectorMode, EntrySeed, PendingArtifact,
    PipelineConfig, PipelineRequest, StoryboardEntry, StoryboardPipeline,
};

/// 视频分镜工具 - 检测场景、采样关键帧、转录台词并按分镜合成视频
#[derive(Parser, Debug)]
#[command(name = "video-storyboard")]
#[command(about = "视频分镜工具：场景检测、关键帧采样、语音转录、分镜合成与产物重建", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

/// 场景检测相关参数
#[derive(ClapArgs, Debug, Clone)]
struct DetectorArgs {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 检测模式：content（硬切）或 fade（淡入淡出）
    #[arg(long)]
    mode: Option<DetectorMode>,

    /// 场景切换阈值，值越小越敏感
    /// 可通过环境变量 STORYBOARD_DETECTOR_THRESHOLD 或配置文件设置
    #[arg(long)]
    threshold: Option<f64>,

    /// 两个切点之间的最小帧数
    #[arg(long)]
    min_scene_len: Option<u64>,

    /// 帧指标缓存目录
    #[arg(long)]
    stats_cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行完整流水线
    Process {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 项目目录
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        #[command(flatten)]
        detector: DetectorArgs,

        /// 分镜种子 JSON 文件（数组），未提供时每个场景一个分镜
        #[arg(long)]
        entries: Option<PathBuf>,

        /// 配音音轨，用于回退合成时确定画面时长
        #[arg(long)]
        narration: Option<PathBuf>,

        /// 转录语言（如 zh、en），未设置时自动识别
        #[arg(long)]
        language: Option<String>,

        /// Whisper 模型 (tiny, base, small, medium, large)
        #[arg(long)]
        whisper_model: Option<String>,

        /// 回退合成的默认时长（秒）
        #[arg(long)]
        default_duration: Option<f64>,
    },
    /// 只检测场景并采样关键帧
    Detect {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 项目目录
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        #[command(flatten)]
        detector: DetectorArgs,
    },
    /// 按分镜列表重建产物目录（列表中的 index 为旧序号）
    Reconcile {
        /// 产物目录
        #[arg(short, long)]
        dir: PathBuf,

        /// 分镜列表 JSON 文件；未提供时按目录中现有记录重建
        #[arg(long)]
        entries: Option<PathBuf>,

        /// 配置文件路径
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(default_value = "storyboard.ini")]
        path: PathBuf,
    },
}

impl DetectorArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            mode: self.mode,
            threshold: self.threshold,
            min_scene_len: self.min_scene_len,
            stats_cache_dir: self.stats_cache_dir.clone(),
            ..Default::default()
        }
    }
}

fn init_logging(config: &PipelineConfig) {
    let level = tracing::Level::from_str(&config.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Ctrl-C 时取消正在运行的阶段
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠️  收到中断信号，正在取消...");
            child.cancel();
        }
    });
    token
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("解析 JSON 失败: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Process {
            input,
            output,
            detector,
            entries,
            narration,
            language,
            whisper_model,
            default_duration,
        } => {
            let overrides = ConfigOverrides {
                language,
                whisper_model,
                default_duration,
                ..detector.overrides()
            };
            let config = ConfigLoader::load_config(detector.config.as_deref(), overrides).context("加载配置失败")?;
            init_logging(&config);
            println!(
                "使用配置: mode={}, threshold={:.1}, min_scene_len={}, default_duration={:.1}s",
                config.detector.mode,
                config.detector.threshold,
                config.detector.min_scene_len,
                config.assembler.default_duration
            );

            let seeds: Option<Vec<EntrySeed>> = entries.as_deref().map(read_json).transpose()?;
            let request = PipelineRequest {
                input,
                project_dir: output,
                seeds,
                narration,
            };
            let cancel = cancel_on_ctrl_c();
            let pipeline = StoryboardPipeline::with_whisper(config);
            let result = pipeline.run(request, &cancel).await.context("处理视频失败")?;

            println!("处理状态: {:?}", result.record.status);
            for failure in &result.record.entry_failures {
                println!("  分镜 {} 失败: {}", failure.index, failure.error);
            }
            if let Some(path) = &result.composed {
                println!("完整视频: {}", path.display());
            }
            println!("处理记录: {}", result.record_path.display());
        }
        Commands::Detect { input, output, detector } => {
            let config =
                ConfigLoader::load_config(detector.config.as_deref(), detector.overrides()).context("加载配置失败")?;
            init_logging(&config);

            let cancel = cancel_on_ctrl_c();
            let pipeline = StoryboardPipeline::with_whisper(config);
            let analysis = pipeline.detect(&input, &output, &cancel).await.context("场景检测失败")?;
            println!("检测到 {} 个场景，{} 张关键帧", analysis.scenes.len(), analysis.keyframes.len());
            for scene in &analysis.scenes {
                println!(
                    "  场景 {}: {:.2}s - {:.2}s ({:.2}s)",
                    scene.scene_id, scene.start_time, scene.end_time, scene.duration
                );
            }
        }
        Commands::Reconcile { dir, entries, config } => {
            let config = ConfigLoader::load_config(config.as_deref(), ConfigOverrides::default()).context("加载配置失败")?;
            init_logging(&config);

            let reconciler = ArtifactReconciler::new(&dir);
            let existing: HashMap<usize, EntryRecord> = reconciler
                .load_records()
                .context("读取现有分镜记录失败")?
                .into_iter()
                .map(|r| (r.entry.index, r))
                .collect();
            let entries: Vec<StoryboardEntry> = match entries {
                Some(path) => read_json(&path)?,
                None => {
                    let mut records: Vec<&EntryRecord> = existing.values().collect();
                    records.sort_by_key(|r| r.entry.index);
                    records.into_iter().map(|r| r.entry.clone()).collect()
                }
            };

            // 视频按旧序号从目录中取
            let artifacts: Vec<PendingArtifact> = entries
                .into_iter()
                .map(|entry| {
                    let clip = existing
                        .get(&entry.index)
                        .and_then(|r| r.clip.as_ref())
                        .zip(reconciler.existing_clip(entry.index))
                        .map(|(clip, path)| AssembledClip {
                            index: entry.index,
                            path,
                            duration: clip.duration,
                            source_mode: clip.source_mode,
                            generated_at: clip.generated_at.clone(),
                        });
                    PendingArtifact { entry, clip }
                })
                .collect();

            let report = reconciler.reconcile(&artifacts).context("重建产物目录失败，可直接重试")?;
            println!(
                "已重建 {}: 记录 {} 个，视频 {} 个，删除旧文件 {} 个",
                dir.display(),
                report.records,
                report.clips,
                report.removed
            );
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}
