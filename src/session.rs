use crate::provider::Message;
use crate::tools::{ChatMode, ToolArgs};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Idle duration after which a session is evicted.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Ceiling on concurrent sessions; the least-recently-accessed one is dropped
/// when a new session would exceed it.
pub const MAX_SESSIONS: usize = 1000;

/// Messages retained per session; older entries are trimmed on append.
pub const MAX_MESSAGES_PER_SESSION: usize = 200;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The user's verdict on a pending mutating tool call.
#[derive(Debug, Clone, Copy)]
pub struct ToolCallDecision {
    pub approved: bool,
}

/// A mutating tool call parked until the user approves or denies it.
///
/// The decision channel is single-shot; resolution removes the entry before
/// sending, and a send to an already-resolved (dropped) receiver is a silent
/// no-op, so double resolution cannot wedge anything.
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: ToolArgs,
    pub decision_tx: oneshot::Sender<ToolCallDecision>,
}

struct SessionState {
    user_id: String,
    messages: Vec<Message>,
    #[allow(dead_code)]
    mode: ChatMode,
    pending: HashMap<String, PendingToolCall>,
    created_at: Instant,
    last_accessed: Instant,
}

impl SessionState {
    fn new(user_id: &str, mode: ChatMode) -> Self {
        let now = Instant::now();
        Self {
            user_id: user_id.to_string(),
            messages: Vec::new(),
            mode,
            pending: HashMap::new(),
            created_at: now,
            last_accessed: now,
        }
    }

    fn deny_all_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.decision_tx.send(ToolCallDecision { approved: false });
        }
    }
}

/// In-memory session store. The outer map is read-mostly behind a `RwLock`;
/// each session has its own mutex so sessions never contend with each other.
/// No critical section spans an await point.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the session, returning the effective session id.
    ///
    /// A session owned by a different (non-empty) identity is never reused:
    /// the caller gets a fresh session keyed by `sid + "-" + user_id` and the
    /// original is left untouched.
    pub fn get_or_create(&self, session_id: &str, mode: ChatMode, user_id: &str) -> String {
        let mut sessions = self.sessions.write().unwrap();

        if let Some(existing) = sessions.get(session_id).cloned() {
            let mut state = existing.lock().unwrap();
            if !state.user_id.is_empty() && !user_id.is_empty() && state.user_id != user_id {
                drop(state);
                let derived_id = format!("{}-{}", session_id, user_id);
                if let Some(derived) = sessions.get(&derived_id).cloned() {
                    let mut state = derived.lock().unwrap();
                    state.last_accessed = Instant::now();
                    state.mode = mode;
                    return derived_id;
                }
                sessions.insert(
                    derived_id.clone(),
                    Arc::new(Mutex::new(SessionState::new(user_id, mode))),
                );
                return derived_id;
            }
            state.last_accessed = Instant::now();
            state.mode = mode;
            return session_id.to_string();
        }

        if sessions.len() >= MAX_SESSIONS {
            Self::evict_lru(&mut sessions);
        }

        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionState::new(user_id, mode))),
        );
        session_id.to_string()
    }

    /// Drop the least-recently-accessed session, denying its pending calls.
    /// Caller holds the write lock.
    fn evict_lru(sessions: &mut HashMap<String, Arc<Mutex<SessionState>>>) {
        let oldest = sessions
            .iter()
            .min_by_key(|(_, s)| s.lock().unwrap().last_accessed)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            if let Some(session) = sessions.remove(&id) {
                session.lock().unwrap().deny_all_pending();
                warn!("evicted LRU session {} to enforce max session limit", id);
            }
        }
    }

    fn get(&self, session_id: &str) -> Result<Arc<Mutex<SessionState>>> {
        let sessions = self.sessions.read().unwrap();
        match sessions.get(session_id) {
            Some(s) => Ok(s.clone()),
            None => bail!("session {} not found", session_id),
        }
    }

    /// Snapshot of the session's messages; shares no state with the session.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let session = self.get(session_id)?;
        let mut state = session.lock().unwrap();
        state.last_accessed = Instant::now();
        Ok(state.messages.clone())
    }

    pub fn add_message(&self, session_id: &str, message: Message) -> Result<()> {
        let session = self.get(session_id)?;
        let mut state = session.lock().unwrap();
        state.messages.push(message);
        state.last_accessed = Instant::now();
        if state.messages.len() > MAX_MESSAGES_PER_SESSION {
            let excess = state.messages.len() - MAX_MESSAGES_PER_SESSION;
            state.messages.drain(..excess);
        }
        Ok(())
    }

    /// Err if the session exists and is owned by a different identity.
    pub fn validate_session_owner(&self, session_id: &str, user_id: &str) -> Result<()> {
        let session = self.get(session_id)?;
        let state = session.lock().unwrap();
        if !state.user_id.is_empty() && !user_id.is_empty() && state.user_id != user_id {
            bail!("session {} does not belong to the requesting user", session_id);
        }
        Ok(())
    }

    pub fn add_pending_confirmation(
        &self,
        session_id: &str,
        pending: PendingToolCall,
    ) -> Result<()> {
        let session = self.get(session_id)?;
        let mut state = session.lock().unwrap();
        state.pending.insert(pending.tool_call_id.clone(), pending);
        Ok(())
    }

    /// Deliver the user's decision for a pending tool call. The entry is
    /// removed first; a repeat resolution therefore errors instead of
    /// re-delivering.
    pub fn resolve_confirmation(
        &self,
        session_id: &str,
        tool_call_id: &str,
        approved: bool,
    ) -> Result<()> {
        let session = self.get(session_id)?;
        let pending = {
            let mut state = session.lock().unwrap();
            match state.pending.remove(tool_call_id) {
                Some(p) => p,
                None => bail!("no pending confirmation for tool call {}", tool_call_id),
            }
        };
        // The receiver may already be gone (engine timed out or the session
        // was cleaned up concurrently); dropping the decision is fine.
        let _ = pending.decision_tx.send(ToolCallDecision { approved });
        Ok(())
    }

    /// Evict sessions idle longer than [`SESSION_TIMEOUT`], denying their
    /// pending confirmations so no waiter hangs until its own timeout.
    pub fn cleanup_expired(&self) {
        // Collect candidates under the read lock first.
        let expired_ids: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| s.lock().unwrap().last_accessed.elapsed() > SESSION_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired_ids.is_empty() {
            return;
        }

        let mut sessions = self.sessions.write().unwrap();
        for id in expired_ids {
            let Some(session) = sessions.get(&id).cloned() else {
                continue;
            };
            let mut state = session.lock().unwrap();
            // Re-check expiry under the write lock; the session may have been
            // touched between the two passes.
            if state.last_accessed.elapsed() > SESSION_TIMEOUT {
                state.deny_all_pending();
                let lifetime = state.created_at.elapsed();
                drop(state);
                sessions.remove(&id);
                debug!("cleaned up expired session {} (lived {:?})", id, lifetime);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Spawn the background cleanup task. Runs until the handle is aborted.
    pub fn spawn_cleanup(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.cleanup_expired();
            }
        })
    }

    /// Test hook: pretend the session was last touched `age` ago.
    #[cfg(test)]
    pub(crate) fn backdate(&self, session_id: &str, age: Duration) {
        if let Ok(session) = self.get(session_id) {
            let mut state = session.lock().unwrap();
            state.last_accessed = Instant::now() - age;
            state.created_at = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> (PendingToolCall, oneshot::Receiver<ToolCallDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingToolCall {
                tool_call_id: id.to_string(),
                tool_name: "delete_run".to_string(),
                arguments: ToolArgs::new(),
                decision_tx: tx,
            },
            rx,
        )
    }

    #[test]
    fn get_or_create_reuses_same_session() {
        let manager = SessionManager::new();
        let id = manager.get_or_create("s1", ChatMode::Ask, "");
        assert_eq!(id, "s1");
        manager.add_message("s1", Message::user_text("hi")).unwrap();

        let id = manager.get_or_create("s1", ChatMode::Agent, "");
        assert_eq!(id, "s1");
        assert_eq!(manager.get_messages("s1").unwrap().len(), 1);
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn ownership_conflict_mints_derived_session() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "alice");
        manager.add_message("s1", Message::user_text("private")).unwrap();

        let id = manager.get_or_create("s1", ChatMode::Ask, "bob");
        assert_eq!(id, "s1-bob");
        assert!(manager.get_messages(&id).unwrap().is_empty());
        // Alice's session is untouched.
        assert_eq!(manager.get_messages("s1").unwrap().len(), 1);

        // Bob's derived session is reused on a second request.
        let id2 = manager.get_or_create("s1", ChatMode::Ask, "bob");
        assert_eq!(id2, "s1-bob");
        assert_eq!(manager.session_count(), 2);
    }

    #[test]
    fn empty_identity_is_never_a_conflict() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "alice");
        assert_eq!(manager.get_or_create("s1", ChatMode::Ask, ""), "s1");
    }

    #[test]
    fn add_message_trims_to_limit() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "");
        for i in 0..(MAX_MESSAGES_PER_SESSION + 25) {
            manager
                .add_message("s1", Message::user_text(format!("m{}", i)))
                .unwrap();
        }
        let messages = manager.get_messages("s1").unwrap();
        assert_eq!(messages.len(), MAX_MESSAGES_PER_SESSION);
        // Newest message always survives trimming.
        match &messages.last().unwrap().content {
            crate::provider::MessageContent::Text(t) => {
                assert_eq!(t, &format!("m{}", MAX_MESSAGES_PER_SESSION + 24));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn snapshot_shares_no_state() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "");
        manager.add_message("s1", Message::user_text("a")).unwrap();
        let snapshot = manager.get_messages("s1").unwrap();
        manager.add_message("s1", Message::user_text("b")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(manager.get_messages("s1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolve_confirmation_delivers_once() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Agent, "");
        let (p, rx) = pending("tc-1");
        manager.add_pending_confirmation("s1", p).unwrap();

        manager.resolve_confirmation("s1", "tc-1", true).unwrap();
        assert!(rx.await.unwrap().approved);

        // Entry was removed before delivery, so a repeat resolution errors.
        let err = manager.resolve_confirmation("s1", "tc-1", false).unwrap_err();
        assert!(err.to_string().contains("no pending confirmation"));
    }

    #[test]
    fn resolve_unknown_session_errors() {
        let manager = SessionManager::new();
        assert!(manager.resolve_confirmation("ghost", "tc-1", true).is_err());
    }

    #[tokio::test]
    async fn cleanup_denies_pending_and_removes_expired() {
        let manager = SessionManager::new();
        manager.get_or_create("old", ChatMode::Agent, "");
        manager.get_or_create("fresh", ChatMode::Ask, "");
        let (p, rx) = pending("tc-1");
        manager.add_pending_confirmation("old", p).unwrap();
        manager.backdate("old", SESSION_TIMEOUT + Duration::from_secs(1));

        manager.cleanup_expired();

        assert_eq!(manager.session_count(), 1);
        assert!(manager.get_messages("old").is_err());
        assert!(manager.get_messages("fresh").is_ok());
        assert!(!rx.await.unwrap().approved);
    }

    #[test]
    fn cleanup_respects_recent_touch() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "");
        manager.cleanup_expired();
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn lru_eviction_denies_pending() {
        let manager = SessionManager::new();
        for i in 0..MAX_SESSIONS {
            manager.get_or_create(&format!("s{}", i), ChatMode::Ask, "");
        }
        // Make s0 the stalest and park a confirmation on it.
        let (p, rx) = pending("tc-1");
        manager.add_pending_confirmation("s0", p).unwrap();
        manager.backdate("s0", Duration::from_secs(60));

        manager.get_or_create("overflow", ChatMode::Ask, "");

        assert_eq!(manager.session_count(), MAX_SESSIONS);
        assert!(manager.get_messages("s0").is_err());
        assert!(!rx.await.unwrap().approved);
    }

    #[test]
    fn owner_validation() {
        let manager = SessionManager::new();
        manager.get_or_create("s1", ChatMode::Ask, "alice");
        assert!(manager.validate_session_owner("s1", "alice").is_ok());
        assert!(manager.validate_session_owner("s1", "").is_ok());
        assert!(manager.validate_session_owner("s1", "bob").is_err());
        assert!(manager.validate_session_owner("ghost", "alice").is_err());
    }
}
