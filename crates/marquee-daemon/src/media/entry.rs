//! Queue entries: a shared envelope plus per-provider payload.

use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::db::unix_timestamp;
use marquee_core::user::User;
use serde::{Deserialize, Serialize};

use super::MediaDescriptor;

pub const MEDIA_TYPE_TRACK: &str = "track";

/// Per-provider payload of a queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPayload {
    Track {
        id: String,
        title: String,
        uploader: String,
        artist: String,
        permalink: String,
        thumbnail_url: String,
    },
}

impl MediaPayload {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Track { .. } => MEDIA_TYPE_TRACK,
        }
    }

    pub fn media_id(&self) -> &str {
        match self {
            Self::Track { id, .. } => id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Track { title, .. } => title,
        }
    }

    pub fn descriptor(&self) -> MediaDescriptor {
        MediaDescriptor::new(self.media_type(), self.media_id())
    }
}

/// An entry in the media queue. Invariant after insertion except for the
/// moved-by append and the concealment unveil at play time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    performance_id: String,
    payload: MediaPayload,
    /// `None` means infinite length (live broadcast).
    length: Option<Duration>,
    offset: Duration,
    requested_by: User,
    request_cost: Amount,
    requested_at: i64,
    unskippable: bool,
    concealed: bool,
    moved_by: Vec<String>,
}

impl QueueEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        performance_id: impl Into<String>,
        payload: MediaPayload,
        length: Option<Duration>,
        offset: Duration,
        requested_by: User,
        request_cost: Amount,
        unskippable: bool,
        concealed: bool,
    ) -> Self {
        Self {
            performance_id: performance_id.into(),
            payload,
            length,
            offset,
            requested_by,
            request_cost,
            requested_at: unix_timestamp(),
            unskippable,
            concealed,
            moved_by: Vec::new(),
        }
    }

    pub fn performance_id(&self) -> &str {
        &self.performance_id
    }

    pub fn payload(&self) -> &MediaPayload {
        &self.payload
    }

    pub fn media(&self) -> MediaDescriptor {
        self.payload.descriptor()
    }

    /// The title, hidden while the entry is concealed.
    pub fn visible_title(&self) -> &str {
        if self.concealed {
            ""
        } else {
            self.payload.title()
        }
    }

    pub fn title(&self) -> &str {
        self.payload.title()
    }

    pub const fn length(&self) -> Option<Duration> {
        self.length
    }

    pub const fn is_live(&self) -> bool {
        self.length.is_none()
    }

    /// Remaining play time from the configured offset; `None` for live.
    pub fn play_duration(&self) -> Option<Duration> {
        self.length.map(|l| l.saturating_sub(self.offset))
    }

    pub const fn offset(&self) -> Duration {
        self.offset
    }

    pub fn requested_by(&self) -> &User {
        &self.requested_by
    }

    pub const fn request_cost(&self) -> Amount {
        self.request_cost
    }

    pub const fn requested_at(&self) -> i64 {
        self.requested_at
    }

    pub const fn unskippable(&self) -> bool {
        self.unskippable
    }

    pub const fn concealed(&self) -> bool {
        self.concealed
    }

    pub fn moved_by(&self) -> &[String] {
        &self.moved_by
    }

    pub(crate) fn set_as_moved_by(&mut self, user: &User) {
        self.moved_by.push(user.address().to_string());
    }

    /// Reveal a concealed entry; called when it reaches the queue head.
    pub(crate) fn unveil(&mut self) {
        self.concealed = false;
    }
}

/// Wire representation; round-trips every envelope and payload field.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueEntryJson {
    #[serde(rename = "QueueID")]
    queue_id: String,
    #[serde(rename = "Type")]
    media_type: String,
    #[serde(rename = "ID")]
    id: String,
    title: String,
    uploader: String,
    artist: String,
    permalink: String,
    #[serde(rename = "ThumbnailURL")]
    thumbnail_url: String,
    /// Milliseconds; `None` for live broadcasts.
    duration: Option<u64>,
    offset: u64,
    requested_by: String,
    request_cost: Amount,
    requested_at: i64,
    unskippable: bool,
    concealed: bool,
    moved_by: Vec<String>,
}

impl Serialize for QueueEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let MediaPayload::Track {
            id,
            title,
            uploader,
            artist,
            permalink,
            thumbnail_url,
        } = &self.payload;
        QueueEntryJson {
            queue_id: self.performance_id.clone(),
            media_type: self.payload.media_type().to_string(),
            id: id.clone(),
            title: title.clone(),
            uploader: uploader.clone(),
            artist: artist.clone(),
            permalink: permalink.clone(),
            thumbnail_url: thumbnail_url.clone(),
            duration: self.length.map(|d| d.as_millis() as u64),
            offset: self.offset.as_millis() as u64,
            requested_by: self.requested_by.address().to_string(),
            request_cost: self.request_cost,
            requested_at: self.requested_at,
            unskippable: self.unskippable,
            concealed: self.concealed,
            moved_by: self.moved_by.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueueEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let j = QueueEntryJson::deserialize(deserializer)?;
        if j.media_type != MEDIA_TYPE_TRACK {
            return Err(serde::de::Error::custom(format!(
                "unknown media type {}",
                j.media_type
            )));
        }
        Ok(Self {
            performance_id: j.queue_id,
            payload: MediaPayload::Track {
                id: j.id,
                title: j.title,
                uploader: j.uploader,
                artist: j.artist,
                permalink: j.permalink,
                thumbnail_url: j.thumbnail_url,
            },
            length: j.duration.map(Duration::from_millis),
            offset: Duration::from_millis(j.offset),
            requested_by: User::address_only(j.requested_by),
            request_cost: j.request_cost,
            requested_at: j.requested_at,
            unskippable: j.unskippable,
            concealed: j.concealed,
            moved_by: j.moved_by,
        })
    }
}
