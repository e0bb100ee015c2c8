use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use mulaw_converter::{commands, config};

#[derive(Debug, Parser)]
#[command(name = "mulaw-converter", version, about = "Convert audio files to ITU G.711 mu-law WAV")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert audio files to mu-law WAV
    Convert(commands::ConvertArgs),
    /// Download FFmpeg into the bundled bin directory
    SetupFfmpeg {
        /// Archive to download instead of the configured one
        #[arg(long)]
        url: Option<String>,
        /// Replace an existing installation
        #[arg(long)]
        force: bool,
    },
    /// Show which FFmpeg will be used
    CheckFfmpeg,
    /// Show or change stored defaults
    Settings {
        #[command(subcommand)]
        action: Option<commands::SettingsAction>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // Load configuration
    let config = match config::AppConfig::load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            config::AppConfig::default()
        }
    };

    match cli.command {
        Command::Convert(args) => {
            let summary = commands::convert(&config, args)
                .await
                .context("Conversion failed")?;
            println!("{}", summary.report());
            if !summary.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Command::SetupFfmpeg { url, force } => {
            commands::setup_ffmpeg(&config, url, force)
                .await
                .context("FFmpeg setup failed")?;
        }
        Command::CheckFfmpeg => {
            if !commands::check_ffmpeg(&config).await? {
                std::process::exit(1);
            }
        }
        Command::Settings { action } => {
            let config_path = config::AppConfig::get_config_path()?;
            match action.unwrap_or(commands::SettingsAction::Show) {
                commands::SettingsAction::Show => commands::show_settings(&config, &config_path)?,
                commands::SettingsAction::Set(update) => {
                    let updated = commands::update_settings(config, update)?;
                    updated
                        .save_to(&config_path)
                        .with_context(|| format!("Failed to write {}", config_path.display()))?;
                    commands::show_settings(&updated, &config_path)?;
                }
            }
        }
    }

    Ok(())
}
