use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::converter::registry::RegistryOptions;
use crate::converter::{ffmpeg, ConversionSettings};
use crate::errors::{AppError, Result};

const APP_DIR: &str = "mulaw-converter";
const ENV_PREFIX: &str = "MULAW_CONVERTER";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit FFmpeg executable; wins over `bin_dir` and `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    /// Where `setup-ffmpeg` installs the bundled binary.
    pub bin_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub settings: ConversionSettings,
    /// `0` runs every job at once.
    pub max_concurrent_jobs: usize,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: Option<u64>,
    pub ffmpeg_download_url: String,
    pub proxy: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            bin_dir: dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR).join("bin"))
                .unwrap_or_else(|| PathBuf::from("bin")),
            output_dir: None,
            settings: ConversionSettings::default(),
            max_concurrent_jobs: 0,
            poll_interval_ms: 100,
            job_timeout_secs: None,
            ffmpeg_download_url: default_download_url().to_string(),
            proxy: None,
        }
    }
}

fn default_download_url() -> &'static str {
    if cfg!(windows) {
        "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-win64-gpl.zip"
    } else {
        "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linux64-gpl.zip"
    }
}

impl AppConfig {
    /// Loads the config file (creating it with defaults on first run) and
    /// applies `MULAW_CONVERTER__*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            AppConfig::default().save_to(&config_path)?;
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: AppConfig = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.settings.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                AppError::Config(config::ConfigError::Message(
                    "Could not find config directory".to_string(),
                ))
            })?;

        Ok(config_dir.join(APP_DIR).join("config.json"))
    }

    pub fn resolve_ffmpeg(&self) -> PathBuf {
        ffmpeg::locate(self.ffmpeg_path.as_deref(), &self.bin_dir)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        let mut options = RegistryOptions::new(self.resolve_ffmpeg());
        options.max_concurrent_jobs = self.max_concurrent_jobs;
        options.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        options.job_timeout = self.job_timeout_secs.map(Duration::from_secs);
        options
    }
}
