use clap::{Args, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::converter::registry::JobRegistry;
use crate::converter::{
    ffmpeg, BatchSummary, ConversionEvent, ConversionSettings, CANCELLED_MESSAGE,
};
use crate::errors::{AppError, Result};
use crate::setup::FfmpegInstaller;
use crate::utils::{collect_input_files, display_name, ensure_dir_exists};
use crate::validation::{parse_sample_rate, InputValidator};

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Audio files or directories (.wav .mp3 .flac .ogg .m4a .aac)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Directory for the converted files [default: configured or current directory]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Target sample rate in Hz (8000-48000)
    #[arg(short = 'r', long, value_parser = parse_sample_rate)]
    pub sample_rate: Option<u32>,

    /// Downmix to a single channel
    #[arg(long, conflicts_with = "stereo")]
    pub mono: bool,

    /// Keep two channels
    #[arg(long)]
    pub stereo: bool,

    /// Maximum number of FFmpeg processes at once (0 = unlimited)
    #[arg(short = 'j', long)]
    pub max_jobs: Option<usize>,

    /// FFmpeg executable to use
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Print the current configuration
    Show,
    /// Change stored defaults
    Set(SettingsUpdate),
}

#[derive(Debug, Args)]
pub struct SettingsUpdate {
    #[arg(short = 'r', long, value_parser = parse_sample_rate)]
    pub sample_rate: Option<u32>,

    #[arg(long, conflicts_with = "stereo")]
    pub mono: bool,

    #[arg(long)]
    pub stereo: bool,

    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    #[arg(short = 'j', long)]
    pub max_jobs: Option<usize>,

    #[arg(long)]
    pub ffmpeg_path: Option<PathBuf>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub proxy: Option<String>,
}

fn mono_override(mono: bool, stereo: bool) -> Option<bool> {
    match (mono, stereo) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Settings snapshot for one run: stored defaults with command-line overrides.
pub fn effective_settings(config: &AppConfig, args: &ConvertArgs) -> Result<ConversionSettings> {
    ConversionSettings::new(
        args.sample_rate.unwrap_or(config.settings.sample_rate),
        mono_override(args.mono, args.stereo).unwrap_or(config.settings.mono),
    )
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template("{prefix:30!} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .map_err(|e| AppError::Validation(e.to_string()))?
        .progress_chars("=> "))
}

/// Converts every input and renders one progress row per file. Returns the
/// batch summary once the last job has finished.
///
/// The first Ctrl-C cancels the remaining conversions, a second one returns
/// without waiting for them.
pub async fn convert(config: &AppConfig, args: ConvertArgs) -> Result<BatchSummary> {
    let (interrupt_tx, interrupts) = mpsc::unbounded_channel();
    let listener = tokio::spawn(async move {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    if interrupt_tx.send(()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    break;
                }
            }
        }
    });

    let result = run_conversion(config, args, interrupts).await;
    listener.abort();
    result
}

async fn run_conversion(
    config: &AppConfig,
    args: ConvertArgs,
    mut interrupts: mpsc::UnboundedReceiver<()>,
) -> Result<BatchSummary> {
    let validator = InputValidator::new();

    let files: Vec<PathBuf> = collect_input_files(&args.files)?
        .into_iter()
        .filter(|file| match validator.validate_input_file(file) {
            Ok(()) => true,
            Err(e) => {
                warn!("Skipping {:?}: {}", file, e);
                false
            }
        })
        .collect();
    if files.is_empty() {
        return Err(AppError::Validation("No files to convert!".to_string()));
    }

    let output_dir = match args.output_dir.clone().or_else(|| config.output_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    validator.validate_output_dir(&output_dir)?;
    ensure_dir_exists(&output_dir).await?;

    let settings = effective_settings(config, &args)?;

    let mut options = config.registry_options();
    if let Some(path) = args.ffmpeg.clone() {
        // taken as given, no bundled or PATH fallback
        options.ffmpeg_path = path;
    }
    if let Some(max_jobs) = args.max_jobs {
        options.max_concurrent_jobs = max_jobs;
    }
    if !options.ffmpeg_path.is_file() {
        warn!(
            "FFmpeg not found at {:?}; run `mulaw-converter setup-ffmpeg` to install it",
            options.ffmpeg_path
        );
    }

    let (registry, mut events) = JobRegistry::spawn(options, settings)?;

    let settings = registry.settings().await?;
    info!(
        "Converting {} file(s) to {:?} at {} Hz, {}",
        files.len(),
        output_dir,
        settings.sample_rate,
        if settings.mono { "mono" } else { "stereo" }
    );

    let multi = MultiProgress::new();
    let style = bar_style()?;
    let mut bars: HashMap<PathBuf, ProgressBar> = HashMap::new();
    for file in &files {
        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(style.clone());
        bar.set_prefix(display_name(file));
        bar.set_message("queued");
        bars.insert(file.clone(), bar);
    }

    registry.submit_batch(&files, &output_dir).await?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(AppError::Registry(
                        "Job registry stopped unexpectedly".to_string(),
                    ));
                };
                if let ConversionEvent::BatchComplete(summary) = event {
                    return Ok(summary);
                }
                render_event(&bars, event);
            }
            Some(()) = interrupts.recv() => {
                if interrupted {
                    return Err(AppError::Registry(
                        "Interrupted again, not waiting for conversions to stop".to_string(),
                    ));
                }
                interrupted = true;
                let remaining = registry.active_jobs().await?.len();
                let _ = multi.println(format!(
                    "Cancelling {} remaining conversion(s)... press Ctrl-C again to quit",
                    remaining
                ));
                // cancelled events keep flowing through this loop while clear() waits
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.clear().await {
                        warn!("Failed to cancel conversions: {}", e);
                    }
                });
            }
        }
    }
}

fn render_event(bars: &HashMap<PathBuf, ProgressBar>, event: ConversionEvent) {
    let Some(bar) = event.input().and_then(|input| bars.get(input)) else {
        return;
    };

    match event {
        ConversionEvent::Started { .. } => bar.set_message("converting"),
        ConversionEvent::Progress { percent, .. } => bar.set_position(percent as u64),
        ConversionEvent::Succeeded { output, .. } => {
            bar.finish_with_message(format!("-> {}", display_name(&output)));
        }
        ConversionEvent::Failed { message, .. } => {
            bar.abandon_with_message(format!("failed: {}", message));
        }
        ConversionEvent::Cancelled { .. } => bar.abandon_with_message(CANCELLED_MESSAGE),
        ConversionEvent::BatchComplete(_) => {}
    }
}

pub async fn setup_ffmpeg(config: &AppConfig, url: Option<String>, force: bool) -> Result<PathBuf> {
    let url = url.unwrap_or_else(|| config.ffmpeg_download_url.clone());
    let installer = FfmpegInstaller::new(config.bin_dir.clone(), config.proxy.as_deref())?;
    installer.install(&url, force).await
}

/// Prints which FFmpeg would be used and whether it runs.
pub async fn check_ffmpeg(config: &AppConfig) -> Result<bool> {
    let path = config.resolve_ffmpeg();
    match ffmpeg::version(&path).await {
        Ok(version) => {
            println!("FFmpeg: {}", path.display());
            println!("{}", version);
            Ok(true)
        }
        Err(AppError::FfmpegNotFound(path)) => {
            println!("FFmpeg not found (looked for {}).", path);
            println!("Run `mulaw-converter setup-ffmpeg` to install it.");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub fn show_settings(config: &AppConfig, config_path: &Path) -> Result<()> {
    println!("Config file: {}", config_path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Applies an update to the stored configuration and returns the result.
pub fn update_settings(mut config: AppConfig, update: SettingsUpdate) -> Result<AppConfig> {
    if let Some(rate) = update.sample_rate {
        config.settings.sample_rate = rate;
    }
    if let Some(mono) = mono_override(update.mono, update.stereo) {
        config.settings.mono = mono;
    }
    config.settings.validate()?;

    if let Some(dir) = update.output_dir {
        InputValidator::new().validate_output_dir(&dir)?;
        config.output_dir = Some(dir);
    }
    if let Some(max_jobs) = update.max_jobs {
        config.max_concurrent_jobs = max_jobs;
    }
    if let Some(path) = update.ffmpeg_path {
        config.ffmpeg_path = Some(path);
    }
    if let Some(secs) = update.timeout_secs {
        config.job_timeout_secs = (secs > 0).then_some(secs);
    }
    if let Some(proxy) = update.proxy {
        config.proxy = (!proxy.is_empty()).then_some(proxy);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_args(files: Vec<PathBuf>) -> ConvertArgs {
        ConvertArgs {
            files,
            output_dir: None,
            sample_rate: None,
            mono: false,
            stereo: false,
            max_jobs: None,
            ffmpeg: None,
        }
    }

    fn empty_update() -> SettingsUpdate {
        SettingsUpdate {
            sample_rate: None,
            mono: false,
            stereo: false,
            output_dir: None,
            max_jobs: None,
            ffmpeg_path: None,
            timeout_secs: None,
            proxy: None,
        }
    }

    #[test]
    fn flags_override_stored_settings() {
        let config = AppConfig::default();
        let mut args = convert_args(vec![]);
        args.sample_rate = Some(22050);
        args.stereo = true;

        let settings = effective_settings(&config, &args).unwrap();
        assert_eq!(settings, ConversionSettings { sample_rate: 22050, mono: false });
    }

    #[test]
    fn stored_settings_apply_without_flags() {
        let mut config = AppConfig::default();
        config.settings = ConversionSettings::new(11025, false).unwrap();

        let settings = effective_settings(&config, &convert_args(vec![])).unwrap();
        assert_eq!(settings, config.settings);
    }

    #[test]
    fn settings_update_changes_only_given_fields() {
        let mut update = empty_update();
        update.sample_rate = Some(16000);
        update.max_jobs = Some(4);
        update.timeout_secs = Some(0);

        let config = update_settings(AppConfig::default(), update).unwrap();
        assert_eq!(config.settings.sample_rate, 16000);
        assert!(config.settings.mono);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.job_timeout_secs, None);
    }

    #[tokio::test]
    async fn convert_without_supported_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, b"").unwrap();

        let result = convert(&AppConfig::default(), convert_args(vec![notes])).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn convert_reports_batch_summary() {
        use crate::converter::testing::fake_ffmpeg;

        let dir = tempfile::tempdir().unwrap();
        let script = "case \"$2\" in *bad.flac) echo 'Error: corrupt' >&2; exit 1;; esac\nexit 0";
        let ffmpeg = fake_ffmpeg(dir.path(), script);
        let good = dir.path().join("good.mp3");
        let bad = dir.path().join("bad.flac");
        std::fs::write(&good, b"").unwrap();
        std::fs::write(&bad, b"").unwrap();

        let mut args = convert_args(vec![good.clone(), bad.clone()]);
        args.output_dir = Some(dir.path().join("out"));
        args.ffmpeg = Some(ffmpeg);

        let mut config = AppConfig::default();
        config.poll_interval_ms = 10;

        let summary = convert(&config, args).await.unwrap();
        assert_eq!(summary.succeeded, vec![good]);
        assert_eq!(summary.failed, vec![(bad, "Error: corrupt".to_string())]);
        assert!(dir.path().join("out").is_dir());
    }

    #[cfg(unix)]
    fn sleeping_batch(dir: &Path) -> (AppConfig, ConvertArgs) {
        use crate::converter::testing::fake_ffmpeg;

        let ffmpeg = fake_ffmpeg(dir, "exec sleep 10");
        let inputs = vec![dir.join("one.wav"), dir.join("two.mp3")];
        for input in &inputs {
            std::fs::write(input, b"").unwrap();
        }

        let mut args = convert_args(inputs);
        args.output_dir = Some(dir.join("out"));
        args.ffmpeg = Some(ffmpeg);

        let mut config = AppConfig::default();
        config.poll_interval_ms = 10;
        (config, args)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_cancels_remaining_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (config, args) = sleeping_batch(dir.path());
        let (interrupt_tx, interrupts) = mpsc::unbounded_channel();
        interrupt_tx.send(()).unwrap();

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_conversion(&config, args, interrupts),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.cancelled.len(), 2);
        assert!(summary.succeeded.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_interrupt_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let (config, args) = sleeping_batch(dir.path());
        let (interrupt_tx, interrupts) = mpsc::unbounded_channel();
        interrupt_tx.send(()).unwrap();
        interrupt_tx.send(()).unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_conversion(&config, args, interrupts),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(AppError::Registry(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_ffmpeg_flag_does_not_fall_back() {
        use crate::converter::testing::fake_ffmpeg;

        let dir = tempfile::tempdir().unwrap();
        fake_ffmpeg(dir.path(), "exit 0");
        let input = dir.path().join("call.wav");
        std::fs::write(&input, b"").unwrap();

        let mut args = convert_args(vec![input.clone()]);
        args.output_dir = Some(dir.path().join("out"));
        args.ffmpeg = Some(dir.path().join("typo").join("ffmpeg"));

        let mut config = AppConfig::default();
        config.bin_dir = dir.path().to_path_buf();
        config.poll_interval_ms = 10;

        let summary = convert(&config, args).await.unwrap();
        assert!(summary.succeeded.is_empty());
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.contains("FFmpeg not found"), "{}", summary.failed[0].1);
        assert!(!dir.path().join("args.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_stem_inputs_are_both_written() {
        use crate::converter::testing::fake_ffmpeg;

        let dir = tempfile::tempdir().unwrap();
        let script = "for last; do :; done\nprintf '%s\\n' \"$2\" > \"$last\"";
        let ffmpeg = fake_ffmpeg(dir.path(), script);
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let mp3 = src.join("take.mp3");
        let flac = src.join("take.flac");
        std::fs::write(&mp3, b"").unwrap();
        std::fs::write(&flac, b"").unwrap();

        let out = dir.path().join("out");
        let mut args = convert_args(vec![src.clone()]);
        args.output_dir = Some(out.clone());
        args.ffmpeg = Some(ffmpeg);

        let mut config = AppConfig::default();
        config.poll_interval_ms = 10;

        let summary = convert(&config, args).await.unwrap();
        assert_eq!(summary.succeeded.len(), 2);

        let mut written: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        written.sort();
        assert_eq!(written, vec!["take.wav", "take_mp3.wav"]);
        assert_eq!(
            std::fs::read_to_string(out.join("take.wav")).unwrap().trim_end(),
            flac.to_string_lossy()
        );
    }
}
