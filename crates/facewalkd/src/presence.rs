//! Interactive-client presence.
//!
//! Background extraction yields while any client is attached. Attachments are
//! counted in a watch channel so waiters suspend instead of polling. Remote
//! sessions remember the bus name that opened them and are released when
//! that name leaves the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Presence {
    count: Arc<watch::Sender<usize>>,
    sessions: Arc<Mutex<HashMap<u64, Session>>>,
    next_session: Arc<AtomicU64>,
}

/// Keeps one client attached until dropped.
pub struct PresenceGuard {
    count: Arc<watch::Sender<usize>>,
}

struct Session {
    owner: Option<String>,
    _guard: PresenceGuard,
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn attach(&self) -> PresenceGuard {
        self.count.send_modify(|n| *n += 1);
        PresenceGuard {
            count: self.count.clone(),
        }
    }

    /// Attach on behalf of a remote client, returning an id for [`detach_session`](Self::detach_session).
    pub fn attach_session(&self, owner: Option<&str>) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            owner: owner.map(str::to_string),
            _guard: self.attach(),
        };
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, session);
        id
    }

    /// Drop every session opened by `owner`. Returns how many were dropped.
    pub fn release_owner(&self, owner: &str) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| s.owner.as_deref() != Some(owner));
        before - sessions.len()
    }

    pub fn detach_session(&self, id: u64) -> bool {
        let guard = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        guard.is_some()
    }

    pub fn active(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves immediately when no client is attached, otherwise once the last one leaves.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_without_clients() {
        let presence = Presence::new();
        assert_eq!(presence.active(), 0);
        presence.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_detached() {
        let presence = Presence::new();
        let guard = presence.attach();
        let session = presence.attach_session(None);
        assert_eq!(presence.active(), 2);

        let waiter = {
            let presence = presence.clone();
            tokio::spawn(async move { presence.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert!(presence.detach_session(session));
        assert!(!presence.detach_session(session));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(presence.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_owner_releases_its_sessions() {
        let presence = Presence::new();
        presence.attach_session(Some(":1.7"));
        presence.attach_session(Some(":1.7"));
        let kept = presence.attach_session(Some(":1.8"));
        assert_eq!(presence.active(), 3);

        let waiter = {
            let presence = presence.clone();
            tokio::spawn(async move { presence.wait_idle().await })
        };

        assert_eq!(presence.release_owner(":1.7"), 2);
        assert_eq!(presence.release_owner(":1.7"), 0);
        assert_eq!(presence.active(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert_eq!(presence.release_owner(":1.8"), 1);
        assert!(!presence.detach_session(kept));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
