//! "Now playing" share handoff to the social layer.
//!
//! The session controller composes the share; persisting and rendering the
//! resulting post belongs to the social graph service, reached through
//! [`ShareSink`].

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::provider::Track;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("failed to create share: {0}")]
    Failed(String),
}

/// A composed "now playing" post: content string plus artwork URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NowPlayingShare {
    pub content: String,
    pub artwork_url: Option<String>,
}

impl NowPlayingShare {
    pub fn compose(listener_name: &str, track: &Track) -> Self {
        Self {
            content: format!(
                "{} is listening to {} by {}",
                listener_name,
                track.name,
                track.artists_line()
            ),
            artwork_url: track.artwork_url.clone(),
        }
    }
}

#[async_trait]
pub trait ShareSink: Send + Sync {
    async fn create_post(&self, share: &NowPlayingShare) -> Result<(), ShareError>;
}

/// Sink that drops shares; used when no social backend is wired up.
pub struct NoopShareSink;

#[async_trait]
impl ShareSink for NoopShareSink {
    async fn create_post(&self, _share: &NowPlayingShare) -> Result<(), ShareError> {
        Ok(())
    }
}
