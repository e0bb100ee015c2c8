//! Stand-in FFmpeg executables for process-level tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::converter::job::JobOptions;

/// Writes an executable shell script that records its arguments to
/// `<dir>/args.txt` (one per line) and then runs `body`.
pub fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("ffmpeg");
    let script = format!(
        "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args.txt\"\n{}\n",
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn recorded_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn fast_options(ffmpeg_path: PathBuf) -> JobOptions {
    let mut options = JobOptions::new(ffmpeg_path);
    options.poll_interval = Duration::from_millis(10);
    options
}
