use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use vortex_protocol::{
    CallId, CallPatch, CallRecord, CandidateSide, IceCandidatePayload, Participant,
    ParticipantPatch, PeerId,
};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay closed")]
    Closed,
}

/// Live feed of relay changes. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the relay side has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests and drain loops.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Realtime document store used purely as a message bus between participants.
///
/// Writes are merges. Subscriptions deliver at-least-once: callers must
/// tolerate the same document state or candidate arriving more than once.
#[async_trait]
pub trait SignalingRelay: Send + Sync + 'static {
    async fn merge_call(&self, room: &str, call: &CallId, patch: CallPatch)
    -> Result<(), RelayError>;

    async fn get_call(&self, room: &str, call: &CallId) -> Result<Option<CallRecord>, RelayError>;

    /// Remove a call document and both candidate lists.
    async fn delete_call(&self, room: &str, call: &CallId) -> Result<(), RelayError>;

    /// Like [`delete_call`](Self::delete_call), but only while the stored offer
    /// is one of `offers`. Returns `Ok(false)` and leaves the document alone
    /// when it holds some other negotiation.
    async fn delete_call_if_offer(
        &self,
        room: &str,
        call: &CallId,
        offers: &[String],
    ) -> Result<bool, RelayError>;

    async fn append_candidate(
        &self,
        room: &str,
        call: &CallId,
        side: CandidateSide,
        candidate: IceCandidatePayload,
    ) -> Result<(), RelayError>;

    /// Current document state (if any) followed by every later change.
    async fn watch_call(
        &self,
        room: &str,
        call: &CallId,
    ) -> Result<Subscription<CallRecord>, RelayError>;

    /// Every candidate already in the list, then each new one as it is appended.
    async fn watch_candidates(
        &self,
        room: &str,
        call: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidatePayload>, RelayError>;

    /// Call documents added or modified whose callee is `callee`.
    async fn watch_incoming_calls(
        &self,
        room: &str,
        callee: &PeerId,
    ) -> Result<Subscription<CallRecord>, RelayError>;

    async fn upsert_participant(&self, room: &str, participant: Participant)
    -> Result<(), RelayError>;

    async fn update_participant(
        &self,
        room: &str,
        peer: &PeerId,
        patch: ParticipantPatch,
    ) -> Result<(), RelayError>;

    async fn remove_participant(&self, room: &str, peer: &PeerId) -> Result<(), RelayError>;

    /// Full participant list on subscribe and after every change.
    async fn watch_participants(
        &self,
        room: &str,
    ) -> Result<Subscription<Vec<Participant>>, RelayError>;
}

/// Delete a call document if it still holds one of `offers`, treating
/// "already gone" as success.
pub async fn release_call_best_effort(
    relay: &dyn SignalingRelay,
    room: &str,
    call: &CallId,
    offers: &[String],
) {
    match relay.delete_call_if_offer(room, call, offers).await {
        Ok(true) => debug!(%call, "Call document removed"),
        Ok(false) => debug!(%call, "Call document holds a newer offer, leaving it"),
        Err(RelayError::NotFound(_)) => debug!(%call, "Call document already removed"),
        Err(e) => debug!(%call, "Call document cleanup failed: {e}"),
    }
}
