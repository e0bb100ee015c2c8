use std::path::{Path, PathBuf};
use log::{info, warn};
use crate::converter::SUPPORTED_EXTENSIONS;
use crate::errors::Result;

/// True when the extension is one of the accepted audio formats.
pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Where the mu-law copy of `input` goes: `<output_dir>/<stem>.wav`, or
/// `<stem>_mulaw.wav` when that would overwrite the input itself.
pub fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());

    let candidate = output_dir.join(format!("{}.wav", stem));
    if same_file(&candidate, input) {
        output_dir.join(format!("{}_mulaw.wav", stem))
    } else {
        candidate
    }
}

/// Renames `preferred` when another job of the batch already writes there:
/// `<stem>_<ext>.wav` first, then `<stem>_<ext> (2).wav` and so on.
pub fn unique_output_path(
    input: &Path,
    preferred: PathBuf,
    is_taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    if !is_taken(&preferred) {
        return preferred;
    }

    let dir = preferred.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = preferred
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let base = match input.extension() {
        Some(ext) => format!("{}_{}", stem, ext.to_string_lossy().to_ascii_lowercase()),
        None => stem,
    };

    let usable = |path: &Path| !is_taken(path) && !same_file(path, input);
    let candidate = dir.join(format!("{}.wav", base));
    if usable(&candidate) {
        return candidate;
    }

    let mut n = 2u32;
    loop {
        let candidate = dir.join(format!("{} ({}).wav", base, n));
        if usable(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Expands directories one level deep, keeps supported audio files and
/// drops duplicates while preserving the order given.
pub fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            for entry in entries {
                if is_supported_audio_file(&entry) {
                    files.push(entry);
                }
            }
        } else if is_supported_audio_file(path) {
            files.push(path.clone());
        } else {
            warn!("Skipping unsupported file: {:?}", path);
        }
    }

    let mut seen = std::collections::HashSet::new();
    files.retain(|f| seen.insert(f.clone()));
    Ok(files)
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Display name for a path, falling back to the full path.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
