//! The media queue: an ordered, finite sequence of queue entries with
//! current-playing state and playback timers.
//!
//! All mutations go through the queue's own lock, and every event is fired
//! from inside that critical section so `MediaChanged` keeps its order
//! relative to `EntryAdded`/`EntryRemoved`. The entry at index 0 is the one
//! playing; a driver task advances the head when its play time elapses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_core::config::QueueConfig;
use marquee_core::db::unix_timestamp;
use marquee_core::event::{BufferingGuarantee, Event, NoArgEvent};
use marquee_core::shutdown::ShutdownToken;
use marquee_core::user::{PermissionLevel, User};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::media::QueueEntry;
use crate::storage::{Database, PlayedMediaRow};

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("removal of own queue entries is currently disabled")]
    RemovalDisabled,

    #[error("invalid queue position {0}")]
    InvalidPosition(usize),
}

/// Where a forcibly enqueued entry lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueuePlacement {
    #[default]
    Later,
    PlayNext,
    PlayNow,
}

#[derive(Debug, Clone)]
pub struct EntryAddedEventArgs {
    pub entry: QueueEntry,
    pub placement: EnqueuePlacement,
}

#[derive(Debug, Clone)]
pub struct EntryRemovedEventArgs {
    pub entry: QueueEntry,
    pub index: usize,
}

struct State {
    entries: Vec<QueueEntry>,
    playing_started: Option<Instant>,
    playing_since_unix: Option<i64>,
    insert_cursor: Option<String>,
    skipping_enabled: bool,
    removal_of_own_entries_allowed: bool,
}

/// The shared media queue.
pub struct MediaQueue {
    state: Mutex<State>,
    entry_added: Event<EntryAddedEventArgs>,
    entry_removed: Event<EntryRemovedEventArgs>,
    media_changed: Event<Option<QueueEntry>>,
    queue_updated: NoArgEvent,
    skipping_allowed_updated: NoArgEvent,
}

impl MediaQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                entries: Vec::new(),
                playing_started: None,
                playing_since_unix: None,
                insert_cursor: None,
                skipping_enabled: config.skipping_enabled,
                removal_of_own_entries_allowed: config.removal_of_own_entries_allowed,
            }),
            entry_added: Event::new(),
            entry_removed: Event::new(),
            media_changed: Event::new(),
            queue_updated: NoArgEvent::new(),
            skipping_allowed_updated: NoArgEvent::new(),
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn entry_added(&self) -> &Event<EntryAddedEventArgs> {
        &self.entry_added
    }

    pub fn entry_removed(&self) -> &Event<EntryRemovedEventArgs> {
        &self.entry_removed
    }

    /// Fired when the head changes, including to empty. The value is the new
    /// head; the previous head defines the reward epoch that just ended.
    pub fn media_changed(&self) -> &Event<Option<QueueEntry>> {
        &self.media_changed
    }

    pub fn queue_updated(&self) -> &NoArgEvent {
        &self.queue_updated
    }

    pub fn skipping_allowed_updated(&self) -> &NoArgEvent {
        &self.skipping_allowed_updated
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.lock().expect("queue lock poisoned").entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current head and whether it is playing.
    pub fn currently_playing(&self) -> Option<(QueueEntry, bool)> {
        let state = self.state.lock().expect("queue lock poisoned");
        state
            .entries
            .first()
            .map(|e| (e.clone(), state.playing_started.is_some()))
    }

    pub fn playing_since(&self) -> Option<i64> {
        self.state.lock().expect("queue lock poisoned").playing_since_unix
    }

    pub fn insert_cursor(&self) -> Option<String> {
        self.state.lock().expect("queue lock poisoned").insert_cursor.clone()
    }

    pub fn skipping_enabled(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").skipping_enabled
    }

    pub fn removal_of_own_entries_allowed(&self) -> bool {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .removal_of_own_entries_allowed
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Append an entry (or insert it at the insert cursor when set).
    pub fn enqueue(&self, entry: QueueEntry) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let position = state
            .insert_cursor
            .as_ref()
            .and_then(|cursor| {
                state
                    .entries
                    .iter()
                    .position(|e| e.performance_id() == cursor)
            })
            .unwrap_or(state.entries.len());
        self.insert_at(&mut state, entry, position, EnqueuePlacement::Later);
    }

    /// Admin-only positioned insert.
    pub fn insert_with_placement(&self, entry: QueueEntry, placement: EnqueuePlacement) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let position = match placement {
            EnqueuePlacement::Later => state.entries.len(),
            EnqueuePlacement::PlayNext => 1.min(state.entries.len()),
            EnqueuePlacement::PlayNow => 0,
        };
        self.insert_at(&mut state, entry, position, placement);
    }

    fn insert_at(
        &self,
        state: &mut State,
        entry: QueueEntry,
        position: usize,
        placement: EnqueuePlacement,
    ) {
        let position = position.min(state.entries.len());
        info!(
            performance_id = entry.performance_id(),
            media_id = entry.media().media_id,
            position,
            "Queue entry added"
        );
        state.entries.insert(position, entry.clone());
        self.entry_added.notify(EntryAddedEventArgs { entry, placement });
        if position == 0 {
            self.head_changed(state);
        }
        self.queue_updated.notify();
    }

    /// Remove an entry. Moderators may remove anything; owners may remove
    /// their own entries while own-entry removal is enabled.
    pub fn remove_entry(
        &self,
        performance_id: &str,
        requester: &User,
    ) -> Result<QueueEntry, QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let index = state
            .entries
            .iter()
            .position(|e| e.performance_id() == performance_id)
            .ok_or_else(|| QueueError::EntryNotFound(performance_id.to_string()))?;

        if !requester.permission_level_is_at_least(PermissionLevel::Moderator) {
            let owns = state.entries[index].requested_by().address() == requester.address()
                && !requester.address().is_empty();
            if !owns {
                return Err(QueueError::InsufficientPermissions);
            }
            if !state.removal_of_own_entries_allowed {
                return Err(QueueError::RemovalDisabled);
            }
        }

        let entry = state.entries.remove(index);
        info!(
            performance_id = entry.performance_id(),
            index, "Queue entry removed"
        );
        self.entry_removed.notify(EntryRemovedEventArgs {
            entry: entry.clone(),
            index,
        });
        if index == 0 {
            self.head_changed(&mut state);
        }
        self.queue_updated.notify();
        Ok(entry)
    }

    /// Admin move; appends the mover to the entry's moved-by list. The head
    /// cannot be moved and nothing can be moved into its place.
    pub fn move_entry(
        &self,
        performance_id: &str,
        new_position: usize,
        mover: &User,
    ) -> Result<(), QueueError> {
        if !mover.permission_level_is_at_least(PermissionLevel::Moderator) {
            return Err(QueueError::InsufficientPermissions);
        }
        let mut state = self.state.lock().expect("queue lock poisoned");
        let index = state
            .entries
            .iter()
            .position(|e| e.performance_id() == performance_id)
            .ok_or_else(|| QueueError::EntryNotFound(performance_id.to_string()))?;
        if index == 0 || new_position == 0 || new_position >= state.entries.len() {
            return Err(QueueError::InvalidPosition(new_position));
        }

        let mut entry = state.entries.remove(index);
        entry.set_as_moved_by(mover);
        state.entries.insert(new_position, entry);
        self.queue_updated.notify();
        Ok(())
    }

    /// Skip the current head (no-op on an empty queue).
    pub fn skip_current(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.entries.is_empty() {
            return None;
        }
        let entry = state.entries.remove(0);
        debug!(performance_id = entry.performance_id(), "Current entry skipped");
        self.head_changed(&mut state);
        self.queue_updated.notify();
        Some(entry)
    }

    pub fn set_insert_cursor(&self, cursor: Option<String>, requester: &User) -> Result<(), QueueError> {
        if !requester.permission_level_is_at_least(PermissionLevel::Moderator) {
            return Err(QueueError::InsufficientPermissions);
        }
        self.state.lock().expect("queue lock poisoned").insert_cursor = cursor;
        self.queue_updated.notify();
        Ok(())
    }

    pub fn set_skipping_enabled(&self, enabled: bool) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.skipping_enabled = enabled;
        }
        self.skipping_allowed_updated.notify();
    }

    pub fn set_removal_of_own_entries_allowed(&self, allowed: bool) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .removal_of_own_entries_allowed = allowed;
        self.queue_updated.notify();
    }

    /// Re-arm playing state for the new head and fire `MediaChanged`. Must
    /// run inside the state critical section.
    fn head_changed(&self, state: &mut State) {
        match state.entries.first_mut() {
            Some(head) => {
                head.unveil();
                state.playing_started = Some(Instant::now());
                state.playing_since_unix = Some(unix_timestamp());
            }
            None => {
                state.playing_started = None;
                state.playing_since_unix = None;
            }
        }
        self.media_changed.notify(state.entries.first().cloned());
    }

    // =========================================================================
    // Playback driver
    // =========================================================================

    /// Drives playback: sleeps for the head's remaining play time and then
    /// advances the queue. Also records playback history when a database is
    /// attached. Runs until the token cancels.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownToken, history: Option<Database>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut updated = queue.queue_updated.subscribe(BufferingGuarantee::BufferFirst);
            let mut recorded_head: Option<String> = None;

            loop {
                enum Wait {
                    Empty,
                    Live,
                    Timed(Instant),
                }

                let (wait, head) = {
                    let state = queue.state.lock().expect("queue lock poisoned");
                    match state.entries.first() {
                        None => (Wait::Empty, None),
                        Some(entry) => {
                            let head = Some(entry.clone());
                            match (entry.play_duration(), state.playing_started) {
                                (Some(remaining), Some(started)) => {
                                    (Wait::Timed(started + remaining), head)
                                }
                                _ => (Wait::Live, head),
                            }
                        }
                    }
                };

                // Keep playback history in sync with the observed head.
                if let Some(db) = &history {
                    let head_id = head.as_ref().map(|h| h.performance_id().to_string());
                    if head_id != recorded_head {
                        if let Some(previous) = recorded_head.take() {
                            if let Err(e) = db.mark_played_media_ended(&previous).await {
                                warn!(error = %e, "Failed to close playback history entry");
                            }
                        }
                        if let (Some(entry), Some(id)) = (&head, head_id.clone()) {
                            let row = played_media_row(entry);
                            if let Err(e) = db.insert_played_media(&row).await {
                                warn!(error = %e, "Failed to record playback history entry");
                            }
                            recorded_head = Some(id);
                        }
                    }
                }

                let deadline = match wait {
                    Wait::Timed(deadline) => deadline,
                    _ => Instant::now() + Duration::from_secs(24 * 3600),
                };
                let timed = matches!(wait, Wait::Timed(_));

                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = updated.recv() => {}
                    () = tokio::time::sleep_until(deadline), if timed => {
                        let mut state = queue.state.lock().expect("queue lock poisoned");
                        if !state.entries.is_empty() {
                            let finished = state.entries.remove(0);
                            debug!(
                                performance_id = finished.performance_id(),
                                "Entry finished playing"
                            );
                            queue.head_changed(&mut state);
                            queue.queue_updated.notify();
                        }
                    }
                }
            }
        });
    }
}

fn played_media_row(entry: &QueueEntry) -> PlayedMediaRow {
    PlayedMediaRow {
        id: entry.performance_id().to_string(),
        media_type: entry.media().media_type,
        media_id: entry.media().media_id,
        started_at: unix_timestamp(),
        ended_at: None,
        media_offset: entry.offset().as_secs() as i64,
        media_length: entry
            .length()
            .map_or(i64::MAX, |l| l.as_secs() as i64),
        requested_by: entry.requested_by().address().to_string(),
        request_cost: entry.request_cost().serialize_for_api(),
        unskippable: i64::from(entry.unskippable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaPayload;
    use marquee_core::amount::Amount;

    fn entry(id: &str, length_secs: u64, requested_by: &User) -> QueueEntry {
        QueueEntry::new(
            id,
            MediaPayload::Track {
                id: format!("media-{id}"),
                title: format!("Title {id}"),
                uploader: "uploader".into(),
                artist: "artist".into(),
                permalink: format!("https://tracks.example/{id}"),
                thumbnail_url: String::new(),
            },
            Some(Duration::from_secs(length_secs)),
            Duration::ZERO,
            requested_by.clone(),
            Amount::from_raw(100),
            false,
            false,
        )
    }

    fn plain_user() -> User {
        User::address_only(format!("ban_{}", "1".repeat(60)))
    }

    fn moderator() -> User {
        User::with_permission_level(format!("ban_{}", "3".repeat(60)), PermissionLevel::Moderator)
    }

    #[tokio::test]
    async fn head_is_playing_entry() {
        let queue = MediaQueue::new(QueueConfig::default());
        let user = plain_user();
        queue.enqueue(entry("a", 60, &user));
        queue.enqueue(entry("b", 60, &user));

        let (head, playing) = queue.currently_playing().unwrap();
        assert_eq!(head.performance_id(), "a");
        assert!(playing);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn media_changed_never_reports_previous_head() {
        let queue = MediaQueue::new(QueueConfig::default());
        let user = plain_user();
        let mut changed = queue.media_changed().subscribe(BufferingGuarantee::BufferAll);

        queue.enqueue(entry("a", 60, &user));
        queue.enqueue(entry("b", 60, &user));
        queue.remove_entry("a", &moderator()).unwrap();

        let first = changed.recv().await.unwrap().unwrap();
        assert_eq!(first.performance_id(), "a");
        let second = changed.recv().await.unwrap().unwrap();
        assert_eq!(second.performance_id(), "b");

        let (now_playing, _) = queue.currently_playing().unwrap();
        assert_eq!(now_playing.performance_id(), "b");
    }

    #[tokio::test]
    async fn ownership_enforced_on_removal() {
        let queue = MediaQueue::new(QueueConfig::default());
        let owner = plain_user();
        let stranger = User::address_only(format!("ban_{}", "4".repeat(60)));
        queue.enqueue(entry("a", 60, &owner));
        queue.enqueue(entry("b", 60, &owner));

        let err = queue.remove_entry("b", &stranger).unwrap_err();
        assert!(matches!(err, QueueError::InsufficientPermissions));

        queue.remove_entry("b", &owner).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn own_removal_respects_toggle() {
        let queue = MediaQueue::new(QueueConfig::default());
        let owner = plain_user();
        queue.enqueue(entry("a", 60, &owner));
        queue.enqueue(entry("b", 60, &owner));

        queue.set_removal_of_own_entries_allowed(false);
        let err = queue.remove_entry("b", &owner).unwrap_err();
        assert!(matches!(err, QueueError::RemovalDisabled));
        // moderators bypass the toggle
        queue.remove_entry("b", &moderator()).unwrap();
    }

    #[tokio::test]
    async fn moving_appends_to_moved_by() {
        let queue = MediaQueue::new(QueueConfig::default());
        let user = plain_user();
        queue.enqueue(entry("a", 60, &user));
        queue.enqueue(entry("b", 60, &user));
        queue.enqueue(entry("c", 60, &user));

        let admin = moderator();
        queue.move_entry("c", 1, &admin).unwrap();

        let entries = queue.entries();
        assert_eq!(entries[1].performance_id(), "c");
        assert_eq!(entries[1].moved_by(), &[admin.address().to_string()]);

        let err = queue.move_entry("b", 0, &admin).unwrap_err();
        assert!(matches!(err, QueueError::InvalidPosition(0)));
        let err = queue.move_entry("b", 1, &user).unwrap_err();
        assert!(matches!(err, QueueError::InsufficientPermissions));
    }

    #[tokio::test]
    async fn concealed_head_is_unveiled() {
        let queue = MediaQueue::new(QueueConfig::default());
        let user = plain_user();
        let mut concealed = entry("a", 60, &user);
        // rebuild as concealed
        concealed = QueueEntry::new(
            concealed.performance_id(),
            concealed.payload().clone(),
            concealed.length(),
            concealed.offset(),
            user.clone(),
            concealed.request_cost(),
            false,
            true,
        );
        queue.enqueue(concealed);

        let (head, _) = queue.currently_playing().unwrap();
        assert!(!head.concealed());
        assert_eq!(head.visible_title(), "Title a");
    }

    #[tokio::test(start_paused = true)]
    async fn playback_advances_after_length_elapses() {
        let queue = MediaQueue::new(QueueConfig::default());
        let controller = marquee_core::shutdown::ShutdownController::new();
        queue.start(controller.token(), None);

        let user = plain_user();
        queue.enqueue(entry("a", 120, &user));
        queue.enqueue(entry("b", 60, &user));

        let mut changed = queue.media_changed().subscribe(BufferingGuarantee::BufferAll);

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(queue.len(), 1);
        let (head, _) = queue.currently_playing().unwrap();
        assert_eq!(head.performance_id(), "b");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(queue.is_empty());
        assert!(queue.currently_playing().is_none());

        // the final MediaChanged reports an empty queue
        let mut last = None;
        while let Some(v) = changed.try_recv() {
            last = Some(v);
        }
        assert!(last.unwrap().is_none());
    }

    #[tokio::test]
    async fn play_now_placement_replaces_head() {
        let queue = MediaQueue::new(QueueConfig::default());
        let user = plain_user();
        queue.enqueue(entry("a", 60, &user));
        queue.insert_with_placement(entry("b", 60, &user), EnqueuePlacement::PlayNow);

        let (head, _) = queue.currently_playing().unwrap();
        assert_eq!(head.performance_id(), "b");
        assert_eq!(queue.entries()[1].performance_id(), "a");
    }
}
