use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{ImageSet, MediaError, MediaStore, VideoPlayback, batch_id, check_batch, sanitize_filename};

/// Manages on-disk media storage.
///
/// Objects are stored at `{dir}/{bucket}/{sha256-prefix}-{filename}` and served
/// back under `{public_url}/{bucket}/...` by the HTTP layer. Content addressing
/// keeps two uploads of `photo.jpg` from clobbering each other.
pub struct LocalMedia {
    dir: PathBuf,
    public_url: String,
}

impl LocalMedia {
    pub async fn new(dir: PathBuf, public_url: impl Into<String>) -> Result<Self, MediaError> {
        fs::create_dir_all(&dir).await?;
        info!("Media storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Write one blob and return (object name, public URL).
    async fn put(
        &self,
        bucket: &str,
        content: &[u8],
        filename: &str,
    ) -> Result<(String, String), MediaError> {
        if content.is_empty() {
            return Err(MediaError::Empty);
        }

        let object = object_name(content, filename);
        let bucket_dir = self.dir.join(bucket);
        fs::create_dir_all(&bucket_dir).await?;

        let path = bucket_dir.join(&object);
        let mut file = fs::File::create(&path).await?;
        file.write_all(content).await?;
        file.flush().await?;

        debug!("Stored {} bytes at {}", content.len(), path.display());
        let url = format!("{}/{}/{}", self.public_url, bucket, object);
        Ok((object, url))
    }
}

#[async_trait]
impl MediaStore for LocalMedia {
    async fn store_video(
        &self,
        conversation_key: &str,
        title: &str,
        content: Bytes,
    ) -> Result<VideoPlayback, MediaError> {
        let bucket = format!("videos/{}", sanitize_filename(conversation_key));
        let (object, url) = self.put(&bucket, &content, title).await?;
        Ok(VideoPlayback {
            content_id: format!("{}${}", sanitize_filename(conversation_key), object),
            url,
            // No transcoder locally, so there is no poster frame to point at.
            thumbnail_url: String::new(),
        })
    }

    async fn store_images(
        &self,
        images: Vec<Bytes>,
        filenames: Vec<String>,
    ) -> Result<ImageSet, MediaError> {
        check_batch(&images, &filenames)?;

        let mut urls = Vec::with_capacity(images.len());
        for (image, filename) in images.iter().zip(&filenames) {
            let (_, url) = self.put("images", image, filename).await?;
            urls.push(url);
        }

        Ok(ImageSet {
            content_id: batch_id(&urls),
            // Images double as their own placeholders until a resizer exists.
            thumbnails: urls.clone(),
            urls,
        })
    }

    async fn store_file(&self, content: Bytes, filename: &str) -> Result<String, MediaError> {
        let (_, url) = self.put("files", &content, filename).await?;
        Ok(url)
    }
}

pub(crate) fn object_name(content: &[u8], filename: &str) -> String {
    let digest = Sha256::digest(content);
    format!("{}-{}", &hex::encode(digest)[..16], sanitize_filename(filename))
}
