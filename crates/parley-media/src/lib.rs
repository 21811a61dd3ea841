//! Media port: where video, image and file payloads from binary frames end up.
//!
//! The gateway only sees the [`MediaStore`] trait. Two backends ship here:
//! [`LocalMedia`] writes blobs to disk for development and single-box
//! deployments, [`RemoteMedia`] uploads to an HTTP storage zone and a video
//! library service.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use local::LocalMedia;
pub use remote::{RemoteMedia, RemoteMediaConfig};

/// Where a stored video can be played from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPlayback {
    pub content_id: String,
    pub url: String,
    pub thumbnail_url: String,
}

/// Public URLs of a stored image batch, in upload order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSet {
    pub content_id: String,
    pub urls: Vec<String>,
    pub thumbnails: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no content to store")]
    Empty,

    #[error("{images} images but {filenames} filenames")]
    Mismatch { images: usize, filenames: usize },

    #[error("provider rejected {what} with status {status}")]
    Rejected { what: &'static str, status: u16 },

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    /// Store one video under a conversation-scoped collection.
    async fn store_video(
        &self,
        conversation_key: &str,
        title: &str,
        content: Bytes,
    ) -> Result<VideoPlayback, MediaError>;

    /// Store a batch of images; `filenames[i]` names `images[i]`.
    async fn store_images(
        &self,
        images: Vec<Bytes>,
        filenames: Vec<String>,
    ) -> Result<ImageSet, MediaError>;

    /// Store a single file and return its public URL.
    async fn store_file(&self, content: Bytes, filename: &str) -> Result<String, MediaError>;
}

/// Reduce a client-supplied filename to something safe to use as an object name.
pub fn sanitize_filename(raw: &str) -> String {
    let cleaned: String = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "blob".to_string()
    } else {
        trimmed.to_string()
    }
}

fn check_batch(images: &[Bytes], filenames: &[String]) -> Result<(), MediaError> {
    if images.is_empty() {
        return Err(MediaError::Empty);
    }
    if images.len() != filenames.len() {
        return Err(MediaError::Mismatch {
            images: images.len(),
            filenames: filenames.len(),
        });
    }
    Ok(())
}

/// Stable id for an uploaded batch, derived from its object URLs.
fn batch_id(urls: &[String]) -> String {
    let mut hasher = Sha256::new();
    for url in urls {
        hasher.update(url.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
