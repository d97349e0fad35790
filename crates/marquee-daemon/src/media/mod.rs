//! Media types and the provider capability surface.
//!
//! A media provider adapts one external source to the enqueue protocol. New
//! providers plug in by implementing [`MediaProvider`]; the enqueue manager
//! only sees the narrow capability interface and the closed
//! [`EnqueueOutcome`] refusal enum.

mod entry;
mod track;

pub use entry::{MediaPayload, QueueEntry};
pub use track::{TrackCatalog, TrackInfo, TrackProvider};

#[cfg(test)]
pub(crate) use track::testing as testing_support;

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::amount::Amount;
use marquee_core::user::User;
use serde::{Deserialize, Serialize};

use crate::storage::DatabaseError;

/// Identifies a piece of media at its external source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub media_type: String,
    pub media_id: String,
}

impl MediaDescriptor {
    pub fn new(media_type: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            media_id: media_id.into(),
        }
    }
}

/// Client-supplied description of what to enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaRequestInfo {
    Track {
        permalink: String,
        #[serde(default)]
        start_offset_ms: Option<u64>,
    },
}

/// Outcome of a media enqueue creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Succeeded,
    NotFound,
    AgeRestricted,
    UpcomingLiveBroadcast,
    UnpopularLiveBroadcast,
    NotEmbeddable,
    TooLong,
    AlreadyInQueue,
    PlayedTooRecently,
    Disallowed,
    NotATrack,
}

impl EnqueueOutcome {
    /// The user-facing refusal string; assigned only at the facade.
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Succeeded => "Enqueue request succeeded",
            Self::NotFound => "Content not found",
            Self::AgeRestricted => "This content is age-restricted",
            Self::UpcomingLiveBroadcast => "This is an upcoming live broadcast",
            Self::UnpopularLiveBroadcast => {
                "This live broadcast has insufficient viewers to be allowed on Marquee"
            }
            Self::NotEmbeddable => "This content can't be played outside of its original website",
            Self::TooLong => "This content is longer than 35 minutes",
            Self::AlreadyInQueue => {
                "This content (or the selected time range) is already in the queue"
            }
            Self::PlayedTooRecently => {
                "This content (or the selected time range) was last played on Marquee too recently"
            }
            Self::Disallowed => "This content is disallowed on Marquee",
            Self::NotATrack => "This is not a track",
        }
    }
}

/// Errors from media providers.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Provider-internal state carried from `begin` to `continue`. Exposes just
/// enough for the disallow-list checks in between.
pub trait MediaPreInfo: Send {
    fn media(&self) -> MediaDescriptor;
    fn collections(&self) -> Vec<MediaDescriptor>;
    fn as_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Checks that `continue_enqueue_request` may relax for staff requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueRequestFlags {
    pub unskippable: bool,
    pub concealed: bool,
    pub anonymous: bool,
    pub skip_length_checks: bool,
    pub skip_duplication_checks: bool,
}

/// A fully validated enqueue request with its computed cost; turns into a
/// queue entry once payment is confirmed.
#[derive(Debug, Clone)]
pub struct MediaEnqueueRequest {
    pub payload: MediaPayload,
    pub length: Option<Duration>,
    pub offset: Duration,
    pub request_cost: Amount,
    pub requested_by: User,
    pub unskippable: bool,
    pub concealed: bool,
}

impl MediaEnqueueRequest {
    /// Produce the queue entry for this request under the given performance
    /// id.
    pub fn produce_queue_entry(&self, performance_id: impl Into<String>) -> QueueEntry {
        QueueEntry::new(
            performance_id,
            self.payload.clone(),
            self.length,
            self.offset,
            self.requested_by.clone(),
            self.request_cost,
            self.unskippable,
            self.concealed,
        )
    }
}

pub enum BeginEnqueueOutcome {
    Refused(EnqueueOutcome),
    Ready(Box<dyn MediaPreInfo>),
}

pub enum ContinueEnqueueOutcome {
    Refused(EnqueueOutcome),
    Ready(MediaEnqueueRequest),
}

/// A capability for one external media source.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    fn can_handle_request_type(&self, info: &MediaRequestInfo) -> bool;

    /// Fetch metadata and run source-side checks; returns enough to run the
    /// disallow-list checks.
    async fn begin_enqueue_request(
        &self,
        info: &MediaRequestInfo,
    ) -> Result<BeginEnqueueOutcome, MediaError>;

    /// Run queue-state checks and compute the request cost.
    async fn continue_enqueue_request(
        &self,
        pre_info: Box<dyn MediaPreInfo>,
        requested_by: User,
        flags: EnqueueRequestFlags,
    ) -> Result<ContinueEnqueueOutcome, MediaError>;
}
