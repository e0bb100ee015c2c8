use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use regex::Regex;
use tokio::process::Command;
use crate::converter::ConversionSettings;
use crate::errors::{AppError, Result};

/// Percentage reported once FFmpeg prints stats for an input of unknown length.
pub const FALLBACK_PROGRESS: u8 = 50;

/// Highest value reported before the process has actually exited.
const MAX_RUNNING_PROGRESS: u8 = 99;

pub fn binary_name() -> &'static str {
    if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" }
}

/// Resolves the FFmpeg executable.
///
/// Order: explicitly configured path, the bundled `bin_dir`, then `PATH`.
/// When nothing exists the bundled location is returned anyway so the job can
/// report a missing binary with a useful path.
pub fn locate(configured: Option<&Path>, bin_dir: &Path) -> PathBuf {
    if let Some(path) = configured {
        if path.is_file() {
            return path.to_path_buf();
        }
        log::warn!("Configured FFmpeg path {:?} does not exist", path);
    }

    let bundled = bin_dir.join(binary_name());
    if bundled.is_file() {
        return bundled;
    }

    match which::which("ffmpeg") {
        Ok(path) => {
            log::debug!("Using FFmpeg from PATH: {:?}", path);
            path
        }
        Err(_) => configured.map(Path::to_path_buf).unwrap_or(bundled),
    }
}

/// Arguments for a single mu-law conversion, in the exact order FFmpeg gets them.
pub fn build_args(input: &Path, output: &Path, settings: &ConversionSettings) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(12);
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args.push("-ar".into());
    args.push(settings.sample_rate.to_string().into());
    args.push("-ac".into());
    args.push(settings.channels().to_string().into());
    args.push("-acodec".into());
    args.push("pcm_mulaw".into());
    args.push("-f".into());
    args.push("wav".into());
    args.push("-y".into());
    args.push(output.as_os_str().to_owned());
    args
}

/// Picks the line worth showing from FFmpeg's stderr: the first one mentioning
/// "Error", otherwise everything FFmpeg printed.
pub fn extract_error_message(stderr: &str, status: ExitStatus) -> String {
    if let Some(line) = stderr
        .split(['\r', '\n'])
        .find(|line| line.contains("Error"))
    {
        return line.trim().to_string();
    }

    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("FFmpeg exited with {}", status)
    } else {
        trimmed.to_string()
    }
}

/// Runs `ffmpeg -version` and returns its first line.
pub async fn version(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(AppError::FfmpegNotFound(path.display().to_string()));
    }

    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(AppError::Setup(format!(
            "{} -version exited with {}",
            path.display(),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration regex")
    })
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex")
    })
}

fn parse_timestamp(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Turns FFmpeg's stderr into a monotonic percentage.
///
/// The input duration comes from the `Duration:` header, the position from the
/// `time=` field of each stats line. Inputs without a readable duration only
/// ever report [`FALLBACK_PROGRESS`].
#[derive(Debug, Default)]
pub struct ProgressTracker {
    duration: Option<f64>,
    last: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one stderr line; returns a percentage when it moved forward.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        if self.duration.is_none() {
            if let Some(total) = parse_timestamp(duration_regex(), line) {
                if total > 0.0 {
                    self.duration = Some(total);
                }
                return None;
            }
        }

        if !line.contains("time=") {
            return None;
        }

        let percent = match (self.duration, parse_timestamp(time_regex(), line)) {
            (Some(total), Some(position)) => {
                ((position / total) * 100.0).floor().clamp(0.0, MAX_RUNNING_PROGRESS as f64) as u8
            }
            (Some(_), None) => return None,
            (None, _) => FALLBACK_PROGRESS,
        };

        if percent > self.last {
            self.last = percent;
            Some(percent)
        } else {
            None
        }
    }
}
