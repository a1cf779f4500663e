use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::clip_assembler::AssemblerSettings;
use crate::scene_detector::DetectorMode;

/// 场景检测配置
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub mode: DetectorMode,
    /// 场景切换阈值（content 模式 15-50，fade 模式 8-16）
    pub threshold: f64,
    /// 两个切点之间的最小帧数
    pub min_scene_len: u64,
    /// 计算帧指标前缩放到的宽度
    pub analysis_width: u32,
    /// 帧指标缓存目录，未设置时不缓存
    pub stats_cache_dir: Option<PathBuf>,
}

/// 语音转录配置
#[derive(Debug, Clone)]
pub struct TranscriberSettings {
    pub program: String,
    /// Whisper 模型 (tiny, base, small, medium, large)
    pub model: String,
    /// 强制识别语言，未设置时自动识别
    pub language: Option<String>,
}

/// 流水线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detector: DetectorSettings,
    pub transcriber: TranscriberSettings,
    pub assembler: AssemblerSettings,
    /// Webhook URL（处理完成后回调）
    pub webhook_url: Option<String>,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mode = DetectorMode::default();
        Self {
            detector: DetectorSettings {
                mode,
                threshold: mode.default_threshold(),
                min_scene_len: 15,
                analysis_width: 320,
                stats_cache_dir: None,
            },
            transcriber: TranscriberSettings {
                program: "whisper".to_string(),
                model: "base".to_string(),
                language: None,
            },
            assembler: AssemblerSettings::default(),
            webhook_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        anyhow::ensure!(d.threshold > 0.0, "detector.threshold 必须大于 0，当前: {}", d.threshold);
        anyhow::ensure!(d.analysis_width >= 16, "detector.analysis_width 过小: {}", d.analysis_width);
        anyhow::ensure!(!self.transcriber.model.is_empty(), "transcriber.model 不能为空");

        let a = &self.assembler;
        anyhow::ensure!(
            a.default_duration > 0.0,
            "assembler.default_duration 必须大于 0，当前: {}",
            a.default_duration
        );
        anyhow::ensure!(a.fps > 0, "assembler.fps 必须大于 0");
        anyhow::ensure!(
            a.width > 0 && a.height > 0 && a.width % 2 == 0 && a.height % 2 == 0,
            "assembler 画布尺寸必须为正偶数: {}x{}",
            a.width,
            a.height
        );
        anyhow::ensure!(
            ["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()),
            "未知的日志级别: {}",
            self.log_level
        );
        Ok(())
    }
}

/// 命令行覆盖项（优先级最高）
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub mode: Option<DetectorMode>,
    pub threshold: Option<f64>,
    pub min_scene_len: Option<u64>,
    pub stats_cache_dir: Option<PathBuf>,
    pub language: Option<String>,
    pub whisper_model: Option<String>,
    pub default_duration: Option<f64>,
    pub webhook_url: Option<String>,
    pub log_level: Option<String>,
}

/// 单一来源读到的配置，未出现的键为 None
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    mode: Option<DetectorMode>,
    threshold: Option<f64>,
    min_scene_len: Option<u64>,
    analysis_width: Option<u32>,
    stats_cache_dir: Option<PathBuf>,
    whisper_program: Option<String>,
    whisper_model: Option<String>,
    language: Option<String>,
    default_duration: Option<f64>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    video_codec: Option<String>,
    ffmpeg_program: Option<String>,
    webhook_url: Option<String>,
    log_level: Option<String>,
}

/// 读取并解析一个配置项；空字符串视为未设置
fn field<T>(get: &dyn Fn(&str, &str) -> Option<String>, section: &str, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(section, key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("配置项 {}.{} 的值无效: {:?} ({})", section, key, v, e)),
        None => Ok(None),
    }
}

/// 配置项对应的环境变量名，例如 `detector.threshold` → `STORYBOARD_DETECTOR_THRESHOLD`
pub fn env_key(section: &str, key: &str) -> String {
    format!("STORYBOARD_{}_{}", section.to_uppercase(), key.to_uppercase())
}

impl PartialConfig {
    /// 按 (节, 键) 取值构造
    fn from_lookup(get: impl Fn(&str, &str) -> Option<String>) -> Result<Self> {
        let get: &dyn Fn(&str, &str) -> Option<String> = &get;
        Ok(Self {
            mode: field(get, "detector", "mode")?,
            threshold: field(get, "detector", "threshold")?,
            min_scene_len: field(get, "detector", "min_scene_len")?,
            analysis_width: field(get, "detector", "analysis_width")?,
            stats_cache_dir: field(get, "detector", "stats_cache_dir")?,
            whisper_program: field(get, "transcriber", "program")?,
            whisper_model: field(get, "transcriber", "model")?,
            language: field(get, "transcriber", "language")?,
            default_duration: field(get, "assembler", "default_duration")?,
            fps: field(get, "assembler", "fps")?,
            width: field(get, "assembler", "width")?,
            height: field(get, "assembler", "height")?,
            video_codec: field(get, "assembler", "video_codec")?,
            ffmpeg_program: field(get, "assembler", "ffmpeg_program")?,
            webhook_url: field(get, "storyboard", "webhook_url")?,
            log_level: field::<String>(get, "logging", "level")?.map(|v| v.to_lowercase()),
        })
    }

    /// 从环境变量加载
    fn from_env() -> Result<Self> {
        Self::from_lookup(|section, key| env::var(env_key(section, key)).ok())
    }

    /// 从 INI 配置文件加载，节内找不到时再看 [DEFAULT]
    fn from_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            anyhow::bail!("配置文件不存在: {}", config_path.display());
        }
        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Self::from_lookup(|section, key| ini.get(section, key).or_else(|| ini.get("DEFAULT", key)))
            .with_context(|| format!("配置文件 {} 有误", config_path.display()))
    }

    /// 高优先级来源覆盖低优先级来源
    fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            mode: self.mode.or(lower.mode),
            threshold: self.threshold.or(lower.threshold),
            min_scene_len: self.min_scene_len.or(lower.min_scene_len),
            analysis_width: self.analysis_width.or(lower.analysis_width),
            stats_cache_dir: self.stats_cache_dir.or(lower.stats_cache_dir),
            whisper_program: self.whisper_program.or(lower.whisper_program),
            whisper_model: self.whisper_model.or(lower.whisper_model),
            language: self.language.or(lower.language),
            default_duration: self.default_duration.or(lower.default_duration),
            fps: self.fps.or(lower.fps),
            width: self.width.or(lower.width),
            height: self.height.or(lower.height),
            video_codec: self.video_codec.or(lower.video_codec),
            ffmpeg_program: self.ffmpeg_program.or(lower.ffmpeg_program),
            webhook_url: self.webhook_url.or(lower.webhook_url),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    /// 补上默认值
    fn resolve(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        let mode = self.mode.unwrap_or(defaults.detector.mode);
        PipelineConfig {
            detector: DetectorSettings {
                mode,
                // 阈值的默认值随模式变化
                threshold: self.threshold.unwrap_or_else(|| mode.default_threshold()),
                min_scene_len: self.min_scene_len.unwrap_or(defaults.detector.min_scene_len),
                analysis_width: self.analysis_width.unwrap_or(defaults.detector.analysis_width),
                stats_cache_dir: self.stats_cache_dir,
            },
            transcriber: TranscriberSettings {
                program: self.whisper_program.unwrap_or(defaults.transcriber.program),
                model: self.whisper_model.unwrap_or(defaults.transcriber.model),
                language: self.language,
            },
            assembler: AssemblerSettings {
                default_duration: self.default_duration.unwrap_or(defaults.assembler.default_duration),
                fps: self.fps.unwrap_or(defaults.assembler.fps),
                width: self.width.unwrap_or(defaults.assembler.width),
                height: self.height.unwrap_or(defaults.assembler.height),
                video_codec: self.video_codec.unwrap_or(defaults.assembler.video_codec),
                ffmpeg_program: self.ffmpeg_program.unwrap_or(defaults.assembler.ffmpeg_program),
            },
            webhook_url: self.webhook_url,
            log_level: self.log_level.unwrap_or(defaults.log_level),
        }
    }
}

impl From<ConfigOverrides> for PartialConfig {
    fn from(o: ConfigOverrides) -> Self {
        PartialConfig {
            mode: o.mode,
            threshold: o.threshold,
            min_scene_len: o.min_scene_len,
            stats_cache_dir: o.stats_cache_dir,
            whisper_model: o.whisper_model,
            language: o.language,
            default_duration: o.default_duration,
            webhook_url: o.webhook_url,
            log_level: o.log_level.map(|v| v.to_lowercase()),
            ..Default::default()
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<PipelineConfig> {
        // 显式指定的配置文件必须能读；默认位置找不到文件不算错误
        let file_config = match config_file {
            Some(path) => PartialConfig::from_file(path)?,
            None => match Self::find_default_config() {
                Some(path) => PartialConfig::from_file(&path)?,
                None => PartialConfig::default(),
            },
        };
        let env_config = PartialConfig::from_env().context("环境变量配置有误")?;

        let config = PartialConfig::from(overrides).or(env_config).or(file_config).resolve();
        config.validate()?;
        Ok(config)
    }

    /// 按顺序查找默认位置的配置文件
    pub fn find_default_config() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from("storyboard.ini"), PathBuf::from(".storyboard.ini")];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".storyboard.ini"));
        }
        candidates.push(PathBuf::from("/etc/storyboard.ini"));
        candidates.into_iter().find(|p| p.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PipelineConfig::default();
        let mut ini = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };
        set("detector", "mode", defaults.detector.mode.to_string());
        // 留空时按检测模式取默认阈值（content 30，fade 12）
        set("detector", "threshold", String::new());
        set("detector", "min_scene_len", defaults.detector.min_scene_len.to_string());
        set("detector", "analysis_width", defaults.detector.analysis_width.to_string());
        set("detector", "stats_cache_dir", String::new());
        set("transcriber", "program", defaults.transcriber.program.clone());
        set("transcriber", "model", defaults.transcriber.model.clone());
        set("transcriber", "language", String::new());
        set("assembler", "default_duration", defaults.assembler.default_duration.to_string());
        set("assembler", "fps", defaults.assembler.fps.to_string());
        set("assembler", "width", defaults.assembler.width.to_string());
        set("assembler", "height", defaults.assembler.height.to_string());
        set("assembler", "video_codec", defaults.assembler.video_codec.clone());
        set("assembler", "ffmpeg_program", defaults.assembler.ffmpeg_program.clone());
        set("storyboard", "webhook_url", String::new());
        set("logging", "level", defaults.log_level.clone());

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> Result<PartialConfig> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PartialConfig::from_lookup(|section, key| map.get(&format!("{}.{}", section, key)).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = PartialConfig::default().resolve();
        assert_eq!(config.detector.mode, DetectorMode::Content);
        assert_eq!(config.detector.threshold, 30.0);
        assert_eq!(config.detector.min_scene_len, 15);
        assert_eq!(config.assembler.default_duration, 3.0);
        assert_eq!(config.assembler.video_codec, "libx264");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fade_mode_changes_default_threshold() {
        let config = lookup(&[("detector.mode", "fade")]).unwrap().resolve();
        assert_eq!(config.detector.threshold, 12.0);
    }

    #[test]
    fn test_priority_cli_over_env_over_file() {
        let file = lookup(&[("detector.threshold", "20"), ("transcriber.model", "small"), ("assembler.fps", "30")]).unwrap();
        let env = lookup(&[("detector.threshold", "25"), ("transcriber.model", "medium")]).unwrap();
        let cli = PartialConfig::from(ConfigOverrides {
            threshold: Some(40.0),
            ..Default::default()
        });
        let config = cli.or(env).or(file).resolve();
        assert_eq!(config.detector.threshold, 40.0);
        assert_eq!(config.transcriber.model, "medium");
        assert_eq!(config.assembler.fps, 30);
    }

    #[test]
    fn test_env_key_names() {
        assert_eq!(env_key("detector", "threshold"), "STORYBOARD_DETECTOR_THRESHOLD");
        assert_eq!(env_key("logging", "level"), "STORYBOARD_LOGGING_LEVEL");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(lookup(&[("detector.mode", "histogram")]).is_err());
        assert!(lookup(&[("assembler.fps", "fast")]).is_err());

        let config = lookup(&[("assembler.default_duration", "0")]).unwrap().resolve();
        assert!(config.validate().is_err());
        let config = lookup(&[("logging.level", "loud")]).unwrap().resolve();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = lookup(&[("storyboard.webhook_url", ""), ("transcriber.language", "  ")])
            .unwrap()
            .resolve();
        assert!(config.webhook_url.is_none());
        assert!(config.transcriber.language.is_none());
    }

    #[test]
    fn test_default_config_file_round_trips_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyboard.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let from_file = PartialConfig::from_file(&path).unwrap().resolve();
        let defaults = PipelineConfig::default();
        assert_eq!(from_file.detector.mode, defaults.detector.mode);
        assert_eq!(from_file.detector.threshold, defaults.detector.threshold);
        assert_eq!(from_file.assembler.width, defaults.assembler.width);
        assert!(from_file.detector.stats_cache_dir.is_none());
        assert!(from_file.webhook_url.is_none());
    }

    #[test]
    fn test_default_config_file_leaves_threshold_to_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyboard.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let cli = PartialConfig::from(ConfigOverrides {
            mode: Some(DetectorMode::Fade),
            ..Default::default()
        });
        let config = cli.or(PartialConfig::from_file(&path).unwrap()).resolve();
        assert_eq!(config.detector.mode, DetectorMode::Fade);
        assert_eq!(config.detector.threshold, 12.0);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = ConfigLoader::load_config(Some(Path::new("/no/such/storyboard.ini")), ConfigOverrides::default());
        assert!(result.is_err());
    }
}
