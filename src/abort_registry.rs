use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One cancellation token per conversation with an active stream.
///
/// Cancellation is advisory: the registry only signals the token, the
/// streaming handler decides when to stop.
#[derive(Default)]
pub struct AbortRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_generation: AtomicU64,
}

struct SessionEntry {
    generation: u64,
    token: CancellationToken,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a stream for `conversation_id`.
    ///
    /// A previous entry for the same id is replaced, not cancelled: two
    /// concurrent streams for one conversation is a caller error.
    pub fn begin(&self, conversation_id: &str) -> CancellationToken {
        self.begin_tracked(conversation_id).1
    }

    /// Like [`begin`](Self::begin), also returning the entry's generation so
    /// the owning session can later [`release`](Self::release) only its own
    /// entry.
    pub(crate) fn begin_tracked(&self, conversation_id: &str) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.sessions().insert(
            conversation_id.to_string(),
            SessionEntry {
                generation,
                token: token.clone(),
            },
        );
        if previous.is_some() {
            warn!(
                conversation_id,
                "replacing an active stream session without cancelling it"
            );
        }
        debug!(conversation_id, generation, "stream session started");
        (generation, token)
    }

    /// Signal and forget the conversation's token. Returns whether one existed.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let removed = self.sessions().remove(conversation_id);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                debug!(conversation_id, "stream session cancelled");
                true
            }
            None => false,
        }
    }

    pub fn end(&self, conversation_id: &str) {
        if self.sessions().remove(conversation_id).is_some() {
            debug!(conversation_id, "stream session ended");
        }
    }

    /// Remove the entry for `conversation_id` only if it still belongs to
    /// `generation`. A session that finishes after a newer one replaced it
    /// leaves the newer token in place.
    pub(crate) fn release(&self, conversation_id: &str, generation: u64) {
        let mut sessions = self.sessions();
        if sessions
            .get(conversation_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            sessions.remove(conversation_id);
            debug!(conversation_id, generation, "stream session ended");
        }
    }

    /// Cancel every active session. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, SessionEntry)> = self.sessions().drain().collect();
        for (conversation_id, entry) in &drained {
            entry.token.cancel();
            debug!(conversation_id = %conversation_id, "stream session cancelled at shutdown");
        }
        drained.len()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.sessions().contains_key(conversation_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }
}
