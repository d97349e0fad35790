//! Track media provider.
//!
//! Adapts an external track catalog (an out-of-scope collaborator reached
//! through the [`TrackCatalog`] capability) to the enqueue protocol.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::config::EnqueueConfig;
use marquee_core::user::User;

use super::{
    BeginEnqueueOutcome, ContinueEnqueueOutcome, EnqueueOutcome, EnqueueRequestFlags, MediaDescriptor,
    MediaEnqueueRequest, MediaError, MediaPayload, MediaPreInfo, MediaProvider, MediaRequestInfo,
};
use crate::enqueue::pricer::compute_enqueue_price;
use crate::media::entry::MEDIA_TYPE_TRACK;
use crate::queue::MediaQueue;
use crate::storage::Database;

/// Track metadata as reported by the catalog.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub uploader: String,
    pub artist: String,
    pub permalink: String,
    pub thumbnail_url: String,
    /// `None` for live broadcasts.
    pub duration: Option<Duration>,
    pub embeddable: bool,
    pub age_restricted: bool,
    pub upcoming_live: bool,
}

/// Capability for looking tracks up at their source.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    async fn track_info(&self, permalink: &str) -> Result<Option<TrackInfo>, MediaError>;
}

struct TrackPreInfo {
    info: TrackInfo,
    offset: Duration,
}

impl MediaPreInfo for TrackPreInfo {
    fn media(&self) -> MediaDescriptor {
        MediaDescriptor::new(MEDIA_TYPE_TRACK, self.info.id.clone())
    }

    fn collections(&self) -> Vec<MediaDescriptor> {
        vec![MediaDescriptor::new("artist", self.info.artist.clone())]
    }

    fn as_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// The track provider.
pub struct TrackProvider {
    catalog: Arc<dyn TrackCatalog>,
    db: Database,
    queue: Arc<MediaQueue>,
    config: EnqueueConfig,
}

impl TrackProvider {
    pub fn new(
        catalog: Arc<dyn TrackCatalog>,
        db: Database,
        queue: Arc<MediaQueue>,
        config: EnqueueConfig,
    ) -> Self {
        Self {
            catalog,
            db,
            queue,
            config,
        }
    }
}

#[async_trait]
impl MediaProvider for TrackProvider {
    fn can_handle_request_type(&self, info: &MediaRequestInfo) -> bool {
        matches!(info, MediaRequestInfo::Track { .. })
    }

    async fn begin_enqueue_request(
        &self,
        info: &MediaRequestInfo,
    ) -> Result<BeginEnqueueOutcome, MediaError> {
        let MediaRequestInfo::Track {
            permalink,
            start_offset_ms,
        } = info;

        let Some(track) = self.catalog.track_info(permalink).await? else {
            return Ok(BeginEnqueueOutcome::Refused(EnqueueOutcome::NotFound));
        };
        if track.kind != "track" {
            return Ok(BeginEnqueueOutcome::Refused(EnqueueOutcome::NotATrack));
        }
        if track.upcoming_live {
            return Ok(BeginEnqueueOutcome::Refused(
                EnqueueOutcome::UpcomingLiveBroadcast,
            ));
        }
        if !track.embeddable {
            return Ok(BeginEnqueueOutcome::Refused(EnqueueOutcome::NotEmbeddable));
        }
        if track.age_restricted {
            return Ok(BeginEnqueueOutcome::Refused(EnqueueOutcome::AgeRestricted));
        }

        Ok(BeginEnqueueOutcome::Ready(Box::new(TrackPreInfo {
            info: track,
            offset: Duration::from_millis(start_offset_ms.unwrap_or(0)),
        })))
    }

    async fn continue_enqueue_request(
        &self,
        pre_info: Box<dyn MediaPreInfo>,
        requested_by: User,
        flags: EnqueueRequestFlags,
    ) -> Result<ContinueEnqueueOutcome, MediaError> {
        let pre = pre_info
            .as_any()
            .downcast::<TrackPreInfo>()
            .map_err(|_| MediaError::Catalog("pre-info from a different provider".to_string()))?;
        let track = pre.info;
        let offset = pre.offset.min(track.duration.unwrap_or(Duration::ZERO));

        if !flags.skip_length_checks {
            if let Some(duration) = track.duration {
                let playing = duration.saturating_sub(offset);
                if playing.as_secs() > self.config.max_media_length_secs {
                    return Ok(ContinueEnqueueOutcome::Refused(EnqueueOutcome::TooLong));
                }
            }
        }

        if !flags.skip_duplication_checks {
            let already_queued = self.queue.entries().iter().any(|entry| {
                entry.media() == MediaDescriptor::new(MEDIA_TYPE_TRACK, track.id.clone())
                    && entry.offset() == offset
            });
            if already_queued {
                return Ok(ContinueEnqueueOutcome::Refused(
                    EnqueueOutcome::AlreadyInQueue,
                ));
            }

            let played_recently = self
                .db
                .media_played_recently(MEDIA_TYPE_TRACK, &track.id, self.config.replay_cooldown_secs)
                .await?;
            if played_recently {
                return Ok(ContinueEnqueueOutcome::Refused(
                    EnqueueOutcome::PlayedTooRecently,
                ));
            }
        }

        let request_cost = compute_enqueue_price(&self.config, track.duration, offset);

        Ok(ContinueEnqueueOutcome::Ready(MediaEnqueueRequest {
            payload: MediaPayload::Track {
                id: track.id,
                title: track.title,
                uploader: track.uploader,
                artist: track.artist,
                permalink: track.permalink,
                thumbnail_url: track.thumbnail_url,
            },
            length: track.duration,
            offset,
            request_cost,
            requested_by,
            unskippable: flags.unskippable,
            concealed: flags.concealed,
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Catalog fixture serving a fixed set of tracks by permalink.
    #[derive(Default)]
    pub struct StaticCatalog {
        tracks: Mutex<HashMap<String, TrackInfo>>,
    }

    impl StaticCatalog {
        pub fn with_track(self, track: TrackInfo) -> Self {
            self.tracks
                .lock()
                .unwrap()
                .insert(track.permalink.clone(), track);
            self
        }
    }

    #[async_trait]
    impl TrackCatalog for StaticCatalog {
        async fn track_info(&self, permalink: &str) -> Result<Option<TrackInfo>, MediaError> {
            Ok(self.tracks.lock().unwrap().get(permalink).cloned())
        }
    }

    pub fn plain_track(permalink: &str, id: &str, duration_secs: u64) -> TrackInfo {
        TrackInfo {
            id: id.to_string(),
            kind: "track".to_string(),
            title: format!("Track {id}"),
            uploader: "uploader".to_string(),
            artist: "artist".to_string(),
            permalink: permalink.to_string(),
            thumbnail_url: format!("https://tracks.example/{id}.jpg"),
            duration: Some(Duration::from_secs(duration_secs)),
            embeddable: true,
            age_restricted: false,
            upcoming_live: false,
        }
    }
}
