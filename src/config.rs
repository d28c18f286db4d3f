use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::phash;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Directory that receives the sharded normalized renditions.
    pub root: PathBuf,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

fn default_url_prefix() -> String {
    "/media".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FingerprintConfig {
    /// Longest edge of a stored rendition; larger inputs are scaled down,
    /// smaller ones kept as-is.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_max_dimension() -> u32 {
    1920
}
fn default_jpeg_quality() -> u8 {
    88
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Default Hamming radius for near matches.
    #[serde(default = "default_max_distance")]
    pub max_distance: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_distance: default_max_distance(),
        }
    }
}

fn default_max_distance() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}
fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate fingerprinting
    if !(1..=100).contains(&config.fingerprint.jpeg_quality) {
        anyhow::bail!("fingerprint.jpeg_quality must be in [1, 100]");
    }
    if config.fingerprint.max_dimension < 16 {
        anyhow::bail!("fingerprint.max_dimension must be >= 16");
    }

    // Validate matching
    if config.matching.max_distance > phash::HASH_BITS {
        anyhow::bail!("matching.max_distance must be <= {}", phash::HASH_BITS);
    }

    // Validate media. The prefix becomes a nested route, so it must be a
    // non-root absolute path without a trailing slash.
    if !config.media.url_prefix.starts_with('/') {
        anyhow::bail!("media.url_prefix must start with '/'");
    }
    if config.media.url_prefix.len() < 2 || config.media.url_prefix.ends_with('/') {
        anyhow::bail!("media.url_prefix must name a path below the root, like \"/media\"");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(content: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reprise.toml");
        std::fs::write(&path, content).unwrap();
        load_config(&path)
    }

    const MINIMAL: &str = r#"
[db]
path = "./data/reprise.db"

[media]
root = "./data/media"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load(MINIMAL).unwrap();
        assert_eq!(config.media.url_prefix, "/media");
        assert_eq!(config.fingerprint.max_dimension, 1920);
        assert_eq!(config.fingerprint.jpeg_quality, 88);
        assert_eq!(config.matching.max_distance, 10);
        assert_eq!(config.server.bind, "127.0.0.1:7420");
        assert_eq!(config.server.max_upload_bytes, 32 * 1024 * 1024);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = load(
            r#"
[db]
path = "x.db"

[media]
root = "m"
url_prefix = "/files"

[fingerprint]
max_dimension = 800
jpeg_quality = 70

[matching]
max_distance = 4

[server]
bind = "0.0.0.0:8080"
"#,
        )
        .unwrap();
        assert_eq!(config.media.url_prefix, "/files");
        assert_eq!(config.fingerprint.max_dimension, 800);
        assert_eq!(config.fingerprint.jpeg_quality, 70);
        assert_eq!(config.matching.max_distance, 4);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn zero_jpeg_quality_is_rejected() {
        let err = load(&format!("{}\n[fingerprint]\njpeg_quality = 0\n", MINIMAL)).unwrap_err();
        assert!(err.to_string().contains("jpeg_quality"));
    }

    #[test]
    fn oversized_match_radius_is_rejected() {
        let err = load(&format!("{}\n[matching]\nmax_distance = 65\n", MINIMAL)).unwrap_err();
        assert!(err.to_string().contains("max_distance"));
    }

    #[test]
    fn relative_url_prefix_is_rejected() {
        let err = load(&format!("{}url_prefix = \"media\"\n", MINIMAL)).unwrap_err();
        assert!(err.to_string().contains("url_prefix"));
    }

    #[test]
    fn root_url_prefix_is_rejected() {
        let err = load(&format!("{}url_prefix = \"/\"\n", MINIMAL)).unwrap_err();
        assert!(err.to_string().contains("url_prefix"));
    }

    #[test]
    fn missing_file_errors_with_path() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("not/here.toml"));
    }
}
