use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error};

use crate::local::object_name;
use crate::{ImageSet, MediaError, MediaStore, VideoPlayback, batch_id, check_batch};

/// Connection settings for the hosted storage zone and video library.
#[derive(Debug, Clone)]
pub struct RemoteMediaConfig {
    /// Storage zone API base, e.g. `https://storage.example.net/parley`.
    pub storage_url: String,
    pub storage_key: String,
    /// Public CDN base that mirrors the storage zone.
    pub cdn_url: String,
    /// Video library API base, e.g. `https://video.example.net/library`.
    pub video_api_url: String,
    pub video_library_id: u64,
    pub video_key: String,
}

/// Uploads media to a storage zone (images, files) and a video library (videos).
pub struct RemoteMedia {
    client: Client,
    config: RemoteMediaConfig,
}

#[derive(Debug, Deserialize)]
struct CreatedVideo {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct PlayData {
    #[serde(rename = "videoPlaylistUrl")]
    playlist_url: String,
    #[serde(rename = "thumbnailUrl", default)]
    thumbnail_url: String,
}

impl RemoteMedia {
    pub fn new(config: RemoteMediaConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn storage_path(&self, folder: &str, object: &str) -> String {
        format!("{}/{}/{}", self.config.storage_url.trim_end_matches('/'), folder, object)
    }

    fn public_path(&self, folder: &str, object: &str) -> String {
        format!("{}/{}/{}", self.config.cdn_url.trim_end_matches('/'), folder, object)
    }

    fn video_path(&self, suffix: &str) -> String {
        format!(
            "{}/{}/videos{}",
            self.config.video_api_url.trim_end_matches('/'),
            self.config.video_library_id,
            suffix
        )
    }

    /// PUT one object into the storage zone and return its CDN URL.
    async fn put_object(&self, folder: &str, content: Bytes, filename: &str) -> Result<String, MediaError> {
        if content.is_empty() {
            return Err(MediaError::Empty);
        }

        let object = object_name(&content, filename);
        let res = self
            .client
            .put(self.storage_path(folder, &object))
            .header("AccessKey", &self.config.storage_key)
            .header("Content-Type", "application/octet-stream")
            .header("Accept", "application/json")
            .body(content)
            .send()
            .await?;

        if res.status() != StatusCode::CREATED {
            error!("Storage zone rejected {}/{}: {}", folder, object, res.status());
            return Err(MediaError::Rejected {
                what: "object upload",
                status: res.status().as_u16(),
            });
        }

        debug!("Uploaded {}/{}", folder, object);
        Ok(self.public_path(folder, &object))
    }
}

#[async_trait]
impl MediaStore for RemoteMedia {
    async fn store_video(
        &self,
        conversation_key: &str,
        title: &str,
        content: Bytes,
    ) -> Result<VideoPlayback, MediaError> {
        if content.is_empty() {
            return Err(MediaError::Empty);
        }

        // 1. Create the video entry
        let res = self
            .client
            .post(self.video_path(""))
            .header("AccessKey", &self.config.video_key)
            .json(&serde_json::json!({ "title": format!("{}/{}", conversation_key, title) }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(MediaError::Rejected {
                what: "video creation",
                status: res.status().as_u16(),
            });
        }
        let created: CreatedVideo = res.json().await?;

        // 2. Upload the bytes
        let res = self
            .client
            .put(self.video_path(&format!("/{}", created.guid)))
            .header("AccessKey", &self.config.video_key)
            .body(content)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(MediaError::Rejected {
                what: "video upload",
                status: res.status().as_u16(),
            });
        }

        // 3. Fetch play data
        let res = self
            .client
            .get(self.video_path(&format!("/{}/play", created.guid)))
            .header("AccessKey", &self.config.video_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        if res.status() != StatusCode::OK {
            return Err(MediaError::Rejected {
                what: "video play data",
                status: res.status().as_u16(),
            });
        }
        let play: PlayData = res.json().await?;

        Ok(VideoPlayback {
            content_id: format!("{}${}", self.config.video_library_id, created.guid),
            url: play.playlist_url,
            thumbnail_url: play.thumbnail_url,
        })
    }

    async fn store_images(
        &self,
        images: Vec<Bytes>,
        filenames: Vec<String>,
    ) -> Result<ImageSet, MediaError> {
        check_batch(&images, &filenames)?;

        let mut urls = Vec::with_capacity(images.len());
        for (image, filename) in images.into_iter().zip(&filenames) {
            urls.push(self.put_object("content", image, filename).await?);
        }

        Ok(ImageSet {
            content_id: batch_id(&urls),
            urls,
            thumbnails: Vec::new(),
        })
    }

    async fn store_file(&self, content: Bytes, filename: &str) -> Result<String, MediaError> {
        self.put_object("files", content, filename).await
    }
}
