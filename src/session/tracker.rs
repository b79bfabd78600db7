//! Inbox diffing: per-thread cursors, the participant table and echo
//! suppression.
//!
//! [`InboxTracker::process`] turns one inbox page into the events that are
//! new since the previous page. It is synchronous and does no I/O so the
//! poll loop can call it under a lock and tests can drive it directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, trace, warn};

use super::events::{MessageOrigin, RemoteUser, SessionEvent};
use crate::platform::{InboxThread, ItemContent, ThreadItem};

/// Base URL of post permalinks.
const PERMALINK_BASE: &str = "https://www.instagram.com/p";

/// Convert a platform microsecond timestamp to milliseconds by dropping the
/// last three digits.
///
/// Returns `None` for values too short to carry a millisecond part or that
/// are not decimal.
pub fn normalize_timestamp(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let cut = raw.len().checked_sub(3)?;
    if cut == 0 {
        return None;
    }
    raw.get(..cut)?.parse().ok()
}

/// Ids of items this session sent itself and has not yet seen echoed back.
#[derive(Debug, Default)]
pub struct EchoSet {
    ids: Mutex<HashSet<String>>,
}

impl EchoSet {
    /// Remember an id returned by a successful send.
    pub fn record(&self, id: impl Into<String>) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    /// Remove `id`, returning whether it was pending.
    pub fn take(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Number of pending ids.
    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no ids are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of processing one inbox page.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Events in emission order.
    pub events: Vec<SessionEvent>,
    /// How many item-derived events were produced (drives poll backoff).
    pub new_items: usize,
}

/// Cursor and participant state for one session. Memory only.
#[derive(Debug, Default)]
pub struct InboxTracker {
    cursors: HashMap<String, u64>,
    users: HashMap<String, RemoteUser>,
}

impl InboxTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Millisecond cursor of a thread, `None` before its first sighting.
    pub fn cursor(&self, thread_id: &str) -> Option<u64> {
        self.cursors.get(thread_id).copied()
    }

    /// Look up a participant seen by an earlier page.
    pub fn user(&self, user_id: &str) -> Option<&RemoteUser> {
        self.users.get(user_id)
    }

    /// Store a user without emitting an update (the session's own identity).
    pub fn remember_user(&mut self, user: RemoteUser) {
        self.users.insert(user.user_id.clone(), user);
    }

    /// Diff one inbox page against the stored state.
    pub fn process(&mut self, threads: &[InboxThread], echoes: &EchoSet) -> CycleReport {
        let mut report = CycleReport::default();
        for thread in threads {
            self.sync_users(thread, &mut report);
            self.process_thread(thread, echoes, &mut report);
        }
        report
    }

    fn sync_users(&mut self, thread: &InboxThread, report: &mut CycleReport) {
        for participant in &thread.users {
            let fresh = RemoteUser::from(participant);
            match self.users.get(&fresh.user_id) {
                Some(known) if known.differs_from(&fresh) => {
                    debug!(user_id = %fresh.user_id, "participant changed");
                    report.events.push(SessionEvent::UserUpdate(fresh.clone()));
                    self.users.insert(fresh.user_id.clone(), fresh);
                }
                Some(_) => {}
                None => {
                    self.users.insert(fresh.user_id.clone(), fresh);
                }
            }
        }
    }

    fn process_thread(&mut self, thread: &InboxThread, echoes: &EchoSet, report: &mut CycleReport) {
        let Some(mut cursor) = self.cursor(&thread.thread_id) else {
            // First sighting: seed from the newest item without replaying history.
            let newest = thread
                .items
                .iter()
                .filter_map(|item| normalize_timestamp(&item.timestamp))
                .max()
                .unwrap_or(0);
            debug!(thread_id = %thread.thread_id, cursor = newest, "seeded thread cursor");
            self.cursors.insert(thread.thread_id.clone(), newest);
            return;
        };

        // Items arrive newest-first.
        for item in thread.items.iter().rev() {
            let Some(ts) = normalize_timestamp(&item.timestamp) else {
                warn!(item_id = %item.item_id, timestamp = %item.timestamp, "unparsable item timestamp");
                continue;
            };
            if ts <= cursor {
                continue;
            }

            if echoes.take(&item.item_id) {
                debug!(item_id = %item.item_id, "dropping echo of our own send");
            } else if let Some(event) = classify(thread, item) {
                trace!(item_id = %item.item_id, kind = event.kind(), "new item");
                report.events.push(event);
                report.new_items = report.new_items.saturating_add(1);
            }

            cursor = ts;
            self.cursors.insert(thread.thread_id.clone(), cursor);
        }
    }
}

/// Map a thread item onto the event the bridge relays, if any.
fn classify(thread: &InboxThread, item: &ThreadItem) -> Option<SessionEvent> {
    let origin = MessageOrigin {
        event_id: item.item_id.clone(),
        thread_id: thread.thread_id.clone(),
        thread_title: thread.thread_title.clone(),
        user_id: item.user_id.clone(),
        is_private: thread.is_private(),
    };

    let file = |origin: MessageOrigin, url: Option<&str>| match url.filter(|u| !u.is_empty()) {
        Some(url) => Some(SessionEvent::File {
            origin,
            url: url.to_owned(),
        }),
        None => {
            debug!(item_id = %origin.event_id, "media item without a usable URL");
            None
        }
    };

    match &item.content {
        ItemContent::Text { text } => Some(SessionEvent::Message {
            origin,
            text: text.clone(),
        }),
        ItemContent::Like { like } => Some(SessionEvent::Message {
            origin,
            text: like.clone(),
        }),
        ItemContent::Media { media } => file(origin, media.best_url()),
        ItemContent::VoiceMedia { voice_media } => file(origin, voice_media.audio_url()),
        ItemContent::AnimatedMedia { animated_media } => file(origin, animated_media.url()),
        ItemContent::ReelShare { reel_share } => Some(SessionEvent::ReelShare {
            origin,
            text: reel_share.text.clone().unwrap_or_default(),
            media_url: reel_share
                .media
                .as_ref()
                .and_then(|m| m.best_url())
                .map(str::to_owned),
        }),
        ItemContent::MediaShare { media_share } => {
            let mut summary = Vec::new();
            if let Some(caption) = media_share.caption.as_ref().filter(|c| !c.text.is_empty()) {
                summary.push(caption.text.clone());
            }
            if let Some(code) = media_share.code.as_deref().filter(|c| !c.is_empty()) {
                summary.push(format!("{PERMALINK_BASE}/{code}/"));
            }
            Some(SessionEvent::MediaShare {
                origin,
                text: summary.join("\n"),
                media_url: media_share.best_url().map(str::to_owned),
            })
        }
        ItemContent::Unknown => {
            debug!(item_id = %item.item_id, "skipping unsupported item type");
            None
        }
    }
}
