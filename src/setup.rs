use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use reqwest::{Client, ClientBuilder, Proxy};
use crate::converter::ffmpeg;
use crate::errors::{AppError, Result};
use crate::utils::ensure_dir_exists;
use crate::validation::InputValidator;

/// Downloads an FFmpeg build archive and installs the executable into the
/// bundled `bin` directory.
pub struct FfmpegInstaller {
    client: Client,
    bin_dir: PathBuf,
}

impl FfmpegInstaller {
    pub fn new(bin_dir: PathBuf, proxy: Option<&str>) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("mulaw-converter/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .brotli(true);

        if let Some(proxy_url) = proxy {
            info!("Using proxy: {}", proxy_url);
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
            bin_dir,
        })
    }

    pub fn target_path(&self) -> PathBuf {
        self.bin_dir.join(ffmpeg::binary_name())
    }

    /// Installs FFmpeg from `url`. An existing binary is kept unless `force`.
    pub async fn install(&self, url: &str, force: bool) -> Result<PathBuf> {
        let target = self.target_path();
        if target.is_file() && !force {
            info!("FFmpeg already installed at {:?}", target);
            return Ok(target);
        }

        let url = InputValidator::new().validate_download_url(url)?;
        ensure_dir_exists(&self.bin_dir).await?;

        let archive = tempfile::Builder::new()
            .prefix("ffmpeg-")
            .suffix(".zip")
            .tempfile_in(&self.bin_dir)?;

        println!("Downloading FFmpeg...");
        let size = self.download(url.as_str(), archive.as_file()).await?;
        info!("Downloaded {} bytes from {}", size, url);

        println!("Extracting FFmpeg...");
        let archive_path = archive.path().to_path_buf();
        let bin_dir = self.bin_dir.clone();
        let installed = tokio::task::spawn_blocking(move || extract_ffmpeg(&archive_path, &bin_dir))
            .await
            .map_err(|e| AppError::Setup(format!("Extraction task failed: {}", e)))??;

        if let Err(e) = archive.close() {
            warn!("Failed to remove downloaded archive: {}", e);
        }

        println!("FFmpeg has been installed successfully!");
        println!("FFmpeg is located at: {}", installed.display());
        Ok(installed)
    }

    async fn download(&self, url: &str, mut dest: &File) -> Result<u64> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Setup(format!("HTTP error: {}", response.status())));
        }

        let progress = match response.content_length() {
            Some(total) => {
                let bar = ProgressBar::new(total);
                let style = ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .map_err(|e| AppError::Setup(e.to_string()))?
                .progress_chars("#>-");
                bar.set_style(style);
                bar
            }
            None => ProgressBar::new_spinner(),
        };

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            dest.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            progress.set_position(downloaded);
        }
        dest.flush()?;
        progress.finish_and_clear();

        Ok(downloaded)
    }
}

/// Copies the `ffmpeg` executable out of a build archive into `dest_dir`.
pub fn extract_ffmpeg(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let wanted = ffmpeg::binary_name();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let is_ffmpeg = entry
            .name()
            .rsplit('/')
            .next()
            .map(|name| name.eq_ignore_ascii_case(wanted))
            .unwrap_or(false);
        if !is_ffmpeg {
            continue;
        }

        std::fs::create_dir_all(dest_dir)?;
        let target = dest_dir.join(wanted);
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;
        }

        info!("Extracted {} to {:?}", entry.name(), target);
        return Ok(target);
    }

    Err(AppError::Setup(format!("Archive does not contain {}", wanted)))
}
