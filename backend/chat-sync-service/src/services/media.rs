//! Media storage behind a trait; the default keeps uploads on local disk.

use crate::config::MediaConfig;
use crate::error::{AppError, AppResult};
use crate::models::MediaRef;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use uuid::Uuid;

/// Stored media payload
#[derive(Debug, Clone)]
pub struct MediaObject {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store an upload and return a reference to attach to a message
    async fn put(&self, content_type: &str, bytes: Vec<u8>) -> AppResult<MediaRef>;

    async fn get(&self, key: &str) -> AppResult<Option<MediaObject>>;

    fn url_for(&self, media: &MediaRef) -> String;
}

/// Coarse kind shown by clients: image, video, audio or file
pub fn media_category(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if essence.starts_with("image/") {
        "image"
    } else if essence.starts_with("video/") {
        "video"
    } else if essence.starts_with("audio/") {
        "audio"
    } else {
        "file"
    }
}

const KNOWN_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
    ("audio/mpeg", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/wav", "wav"),
    ("application/pdf", "pdf"),
    ("text/plain", "txt"),
];

const FALLBACK_TYPE: &str = "application/octet-stream";

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    KNOWN_TYPES
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(essence))
        .map(|(_, ext)| *ext)
        .unwrap_or("bin")
}

fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    KNOWN_TYPES
        .iter()
        .find(|(_, known)| *known == ext)
        .map(|(mime, _)| *mime)
        .unwrap_or(FALLBACK_TYPE)
}

/// Keys are generated as `<uuid>.<ext>`; anything else never touches the disk.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && !key.starts_with('.')
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

pub struct LocalMediaStore {
    dir: PathBuf,
    public_path: String,
    max_bytes: usize,
}

impl LocalMediaStore {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            public_path: config.public_path.trim_end_matches('/').to_string(),
            max_bytes: config.max_upload_bytes,
        }
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn put(&self, content_type: &str, bytes: Vec<u8>) -> AppResult<MediaRef> {
        if bytes.is_empty() {
            return Err(AppError::BadRequest("empty media upload".into()));
        }
        if bytes.len() > self.max_bytes {
            return Err(AppError::BadRequest(format!(
                "media exceeds {} bytes",
                self.max_bytes
            )));
        }

        let key = format!("{}.{}", Uuid::new_v4().simple(), extension_for(content_type));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&key), &bytes).await?;

        tracing::debug!(key = %key, size = bytes.len(), content_type, "media stored");
        Ok(MediaRef {
            key,
            media_type: media_category(content_type).to_string(),
        })
    }

    async fn get(&self, key: &str) -> AppResult<Option<MediaObject>> {
        if !is_valid_key(key) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(key)).await {
            Ok(bytes) => Ok(Some(MediaObject {
                content_type: content_type_for(key),
                bytes,
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, media: &MediaRef) -> String {
        format!("{}/{}", self.public_path, media.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> LocalMediaStore {
        LocalMediaStore::new(&MediaConfig {
            dir: dir.to_path_buf(),
            max_upload_bytes: 16,
            public_path: "/media/".to_string(),
        })
    }

    #[test]
    fn test_media_category() {
        assert_eq!(media_category("image/png"), "image");
        assert_eq!(media_category("video/mp4; codecs=avc1"), "video");
        assert_eq!(media_category("audio/mpeg"), "audio");
        assert_eq!(media_category("application/zip"), "file");
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("0f3a.png"));
        assert!(!is_valid_key("../etc/passwd"));
        assert!(!is_valid_key("a/b.png"));
        assert!(!is_valid_key(".hidden"));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let media = store(dir.path());

        let stored = media.put("image/png", b"png-bytes".to_vec()).await.unwrap();
        assert_eq!(stored.media_type, "image");
        assert!(stored.key.ends_with(".png"));
        assert_eq!(media.url_for(&stored), format!("/media/{}", stored.key));

        let object = media.get(&stored.key).await.unwrap().unwrap();
        assert_eq!(object.bytes, b"png-bytes");
        assert_eq!(object.content_type, "image/png");

        assert!(media.get("missing.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let media = store(dir.path());
        assert!(matches!(
            media.put("text/plain", vec![b'x'; 17]).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            media.put("text/plain", Vec::new()).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
