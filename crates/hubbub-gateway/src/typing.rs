//! Typing debouncer: raw signals in, discrete start/stop events out.
//!
//! The first signal for a key starts a burst; every signal (re)arms a 3 s
//! expiry timer by atomically replacing the previous one. Expiries surface on
//! a channel drained by the gateway, which broadcasts `typing: false`. A
//! generation counter keeps a superseded timer from firing after re-arm.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hubbub_core::ids::{ChannelId, UserId, WorkspaceId};

/// Identity of one typing burst.
///
/// Keyed by (channel, user); the workspace rides along because a channel
/// lives in exactly one workspace and the expiry broadcast needs the scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypingKey {
    /// Workspace the channel lives in.
    pub workspace_id: WorkspaceId,
    /// Channel being composed in.
    pub channel_id: ChannelId,
    /// Composing user.
    pub user_id: UserId,
}

struct TimerSlot {
    generation: u64,
    task: JoinHandle<()>,
}

/// Debounces typing signals per (channel, user).
pub struct TypingDebouncer {
    slots: Arc<Mutex<HashMap<TypingKey, TimerSlot>>>,
    expiry: Duration,
    expired_tx: mpsc::UnboundedSender<TypingKey>,
    next_generation: AtomicU64,
}

impl TypingDebouncer {
    /// Create a debouncer; the receiver yields keys whose bursts expired.
    #[must_use]
    pub fn new(expiry: Duration) -> (Self, mpsc::UnboundedReceiver<TypingKey>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                slots: Arc::new(Mutex::new(HashMap::new())),
                expiry,
                expired_tx,
                next_generation: AtomicU64::new(0),
            },
            expired_rx,
        )
    }

    /// Record a typing signal. Returns `true` if this starts a new burst
    /// (the caller broadcasts `typing: true` exactly then).
    ///
    /// Must be called from within a tokio runtime.
    pub fn signal(&self, key: TypingKey) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(expire_after(
            Arc::clone(&self.slots),
            self.expired_tx.clone(),
            key,
            generation,
            self.expiry,
        ));
        let mut slots = self.slots.lock();
        match slots.insert(key, TimerSlot { generation, task }) {
            Some(previous) => {
                previous.task.abort();
                false
            }
            None => true,
        }
    }

    /// Cancel a pending burst without emitting a stop event.
    ///
    /// Used when a chat send supersedes the burst. Returns whether a burst
    /// was live.
    pub fn clear(&self, key: TypingKey) -> bool {
        match self.slots.lock().remove(&key) {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending burst for a user, returning the affected keys so
    /// the caller can broadcast `typing: false` for each.
    pub fn clear_user(&self, user_id: UserId) -> Vec<TypingKey> {
        let mut cleared = Vec::new();
        self.slots.lock().retain(|key, slot| {
            if key.user_id == user_id {
                slot.task.abort();
                cleared.push(*key);
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Whether a burst is currently live for the key.
    ///
    /// The expiry drain uses this to discard a stop event that raced with the
    /// start of a fresh burst.
    #[must_use]
    pub fn is_active(&self, key: TypingKey) -> bool {
        self.slots.lock().contains_key(&key)
    }

    /// Number of live bursts.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }
}

async fn expire_after(
    slots: Arc<Mutex<HashMap<TypingKey, TimerSlot>>>,
    expired_tx: mpsc::UnboundedSender<TypingKey>,
    key: TypingKey,
    generation: u64,
    expiry: Duration,
) {
    tokio::time::sleep(expiry).await;
    let fired = {
        let mut slots = slots.lock();
        if slots
            .get(&key)
            .is_some_and(|slot| slot.generation == generation)
        {
            let _ = slots.remove(&key);
            true
        } else {
            false
        }
    };
    if fired {
        let _ = expired_tx.send(key);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
