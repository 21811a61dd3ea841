use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use parley_gateway::GatewayConfig;
use parley_gateway::codec::FrameFormat;
use parley_media::RemoteMediaConfig;

/// Largest WebSocket message accepted by default (64 MiB).
const DEFAULT_MAX_FRAME_BYTES: usize = 64 << 20;

#[derive(Debug, Clone)]
pub enum MediaBackend {
    /// Blobs on local disk, served back under `/media`.
    Local { dir: PathBuf, public_url: String },
    Remote(RemoteMediaConfig),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub max_frame_bytes: usize,
    pub gateway: GatewayConfig,
    pub media: MediaBackend,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port: u16 = or("PARLEY_PORT", "2565")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let max_frame_bytes: usize = match get("PARLEY_MAX_FRAME_BYTES") {
            Some(raw) => raw.parse().context("PARLEY_MAX_FRAME_BYTES must be a byte count")?,
            None => DEFAULT_MAX_FRAME_BYTES,
        };

        let frame_format: FrameFormat = or("PARLEY_FRAME_FORMAT", "length-prefixed")
            .parse()
            .map_err(anyhow::Error::msg)?;
        let persist_group_before_broadcast = match get("PARLEY_PERSIST_GROUP_FIRST").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => bail!("PARLEY_PERSIST_GROUP_FIRST must be true or false, got '{}'", other),
        };

        let media = match or("PARLEY_MEDIA_BACKEND", "local").as_str() {
            "local" => MediaBackend::Local {
                dir: PathBuf::from(or("PARLEY_MEDIA_DIR", "./media")),
                public_url: or("PARLEY_MEDIA_PUBLIC_URL", &format!("http://localhost:{}/media", port)),
            },
            "remote" => {
                let required = |key: &str| {
                    get(key)
                        .filter(|v| !v.is_empty())
                        .with_context(|| format!("{} must be set for the remote media backend", key))
                };
                MediaBackend::Remote(RemoteMediaConfig {
                    storage_url: required("PARLEY_STORAGE_URL")?,
                    storage_key: required("PARLEY_STORAGE_KEY")?,
                    cdn_url: required("PARLEY_CDN_URL")?,
                    video_api_url: required("PARLEY_VIDEO_API_URL")?,
                    video_library_id: required("PARLEY_VIDEO_LIBRARY_ID")?
                        .parse()
                        .context("PARLEY_VIDEO_LIBRARY_ID must be numeric")?,
                    video_key: required("PARLEY_VIDEO_KEY")?,
                })
            }
            other => bail!("PARLEY_MEDIA_BACKEND must be 'local' or 'remote', got '{}'", other),
        };

        Ok(Self {
            host: or("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(or("PARLEY_DB_PATH", "parley.db")),
            max_frame_bytes,
            gateway: GatewayConfig {
                frame_format,
                persist_group_before_broadcast,
            },
            media,
        })
    }
}
