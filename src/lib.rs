//! Batch conversion of audio files to ITU G.711 mu-law WAV through FFmpeg.
//!
//! [`converter::registry::JobRegistry`] owns the running conversions and
//! reports their progress as [`converter::ConversionEvent`]s; the binary is a
//! command-line shell on top of it.

pub mod commands;
pub mod config;
pub mod converter;
pub mod errors;
pub mod setup;
pub mod utils;
pub mod validation;
