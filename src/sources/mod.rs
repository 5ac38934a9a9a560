pub mod ytdlp;

use async_trait::async_trait;
use serenity::model::id::UserId;
use std::time::Duration;

use crate::error::PlayerResult;

pub use ytdlp::YtDlpResolver;

/// Convierte una búsqueda o URL en pistas reproducibles.
///
/// Retries happen inside the implementation; callers treat a failure as final.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resuelve una búsqueda o URL a un descriptor de pista
    async fn resolve(&self, query: &str, requested_by: UserId) -> PlayerResult<TrackDescriptor>;

    /// Obtiene un handle reproducible (URL directa) para el descriptor.
    ///
    /// Called on every pipeline start, since direct stream URLs expire.
    async fn stream_url(&self, track: &TrackDescriptor) -> PlayerResult<String>;
}

/// Pista resuelta y lista para reproducir. Inmutable una vez creada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    source_ref: String,
    title: String,
    duration: Option<Duration>,
    requested_by: UserId,
    uploader: Option<String>,
    thumbnail: Option<String>,
    source_name: String,
}

impl TrackDescriptor {
    pub fn new(source_ref: impl Into<String>, title: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            source_ref: source_ref.into(),
            title: title.into(),
            duration: None,
            requested_by,
            uploader: None,
            thumbnail: None,
            source_name: "YouTube".to_string(),
        }
    }

    // Getters
    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn uploader(&self) -> Option<&str> {
        self.uploader.as_deref()
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    // Builders
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_uploader(mut self, uploader: String) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn with_source_name(mut self, source_name: String) -> Self {
        self.source_name = source_name;
        self
    }
}

/// Verifica si el texto parece una URL http(s)
pub fn looks_like_url(text: &str) -> bool {
    url::Url::parse(text.trim())
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}
