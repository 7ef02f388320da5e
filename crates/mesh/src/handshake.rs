use std::sync::Arc;

use tracing::{debug, info, warn};
use vortex_protocol::{CallPatch, CallRecord, IceCandidatePayload, PeerId, SessionDescription};

use crate::connection::PeerLink;
use crate::relay::{self, RelayError, SignalingRelay};
use crate::transport::{SignalingState, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection to {0} already closed")]
    Closed(PeerId),
}

/// Offer/answer exchange over the relay for every link in one room.
///
/// Each link gets a call-document watcher (remote offers and answers) and a
/// candidate listener on the opposite side's list. Both stop when the link's
/// cancellation token fires.
#[derive(Clone)]
pub struct Handshake {
    relay: Arc<dyn SignalingRelay>,
    room: String,
    local: PeerId,
}

impl Handshake {
    pub fn new(relay: Arc<dyn SignalingRelay>, room: impl Into<String>, local: PeerId) -> Self {
        Self {
            relay,
            room: room.into(),
            local,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    fn ensure_open(link: &PeerLink) -> Result<(), HandshakeError> {
        if link.is_closed() {
            return Err(HandshakeError::Closed(link.remote.clone()));
        }
        Ok(())
    }

    /// Create an offer on the link and publish it. Used for the initial call
    /// and for every renegotiation (track change, ICE restart).
    pub async fn create_offer(&self, link: &Arc<PeerLink>) -> Result<(), HandshakeError> {
        Self::ensure_open(link)?;
        self.ensure_call_watch(link);

        let offer = link.transport.create_offer().await?;
        link.record_local_offer(&offer.sdp);
        link.transport.set_local_description(offer.clone()).await?;
        Self::ensure_open(link)?;
        self.relay
            .merge_call(
                &self.room,
                &link.call_id,
                CallPatch::offer(&self.local, &link.remote, offer.sdp),
            )
            .await?;
        info!(peer = %link.remote, call = %link.call_id, "Offer published");
        Ok(())
    }

    /// Answer a remote offer. Returns `Ok(false)` when the offer was ours,
    /// already handled, arrived while a negotiation was in flight, or the
    /// transport has failed.
    pub async fn handle_offer(
        &self,
        link: &Arc<PeerLink>,
        offer: SessionDescription,
    ) -> Result<bool, HandshakeError> {
        Self::ensure_open(link)?;
        // A dead transport is about to be rebuilt; its replacement answers instead.
        if link.transport.connection_state().is_terminal() {
            debug!(peer = %link.remote, "Not answering on a failed connection");
            return Ok(false);
        }
        if !link.take_remote_offer(&offer.sdp) {
            return Ok(false);
        }
        let state = link.transport.signaling_state();
        if state != SignalingState::Stable {
            warn!(peer = %link.remote, ?state, "Dropping remote offer received mid-negotiation");
            return Ok(false);
        }
        self.ensure_call_watch(link);

        link.transport.set_remote_description(offer).await?;
        self.flush_parked_candidates(link).await;

        let answer = link.transport.create_answer().await?;
        link.record_local_answer(&answer.sdp);
        link.transport.set_local_description(answer.clone()).await?;
        Self::ensure_open(link)?;
        self.relay
            .merge_call(&self.room, &link.call_id, CallPatch::answer(answer.sdp))
            .await?;
        info!(peer = %link.remote, call = %link.call_id, "Answer published");
        Ok(true)
    }

    /// Apply the remote answer to our outstanding offer. Returns `Ok(false)`
    /// when there is no outstanding offer or this answer was already applied.
    pub async fn apply_answer(
        &self,
        link: &Arc<PeerLink>,
        answer: SessionDescription,
    ) -> Result<bool, HandshakeError> {
        Self::ensure_open(link)?;
        if link.transport.signaling_state() != SignalingState::HaveLocalOffer {
            return Ok(false);
        }
        if !link.take_remote_answer(&answer.sdp) {
            return Ok(false);
        }
        let sdp = answer.sdp.clone();
        if let Err(e) = link.transport.set_remote_description(answer).await {
            link.release_remote_answer(&sdp);
            return Err(e.into());
        }
        self.flush_parked_candidates(link).await;
        info!(peer = %link.remote, "Remote answer applied");
        Ok(true)
    }

    /// Append a locally gathered candidate to our side's list.
    pub async fn publish_candidate(
        &self,
        link: &PeerLink,
        candidate: IceCandidatePayload,
    ) -> Result<(), HandshakeError> {
        Self::ensure_open(link)?;
        self.relay
            .append_candidate(&self.room, &link.call_id, link.role.local_side(), candidate)
            .await?;
        Ok(())
    }

    /// Drop the link's call document unless a newer negotiation has taken it over.
    pub async fn release_call(&self, link: &PeerLink) {
        let offers = link.negotiated_offers();
        relay::release_call_best_effort(self.relay.as_ref(), &self.room, &link.call_id, &offers)
            .await;
    }

    async fn flush_parked_candidates(&self, link: &PeerLink) {
        for candidate in link.remote_description_applied() {
            apply_candidate(link, candidate).await;
        }
    }

    async fn on_call_record(&self, link: &Arc<PeerLink>, record: CallRecord) {
        let Some(offer) = record.offer else {
            return;
        };
        // An answer only belongs to the offer stored next to it.
        let result = if link.is_local_offer(&offer.sdp) {
            match record.answer {
                Some(answer) => self.apply_answer(link, answer).await,
                None => Ok(false),
            }
        } else {
            self.handle_offer(link, offer).await
        };
        match result {
            Ok(_) | Err(HandshakeError::Closed(_)) => {}
            Err(e) => warn!(peer = %link.remote, "Call document update failed: {e}"),
        }
    }

    fn ensure_call_watch(&self, link: &Arc<PeerLink>) {
        if !link.claim_call_watch() {
            return;
        }
        let this = self.clone();
        let link = Arc::clone(link);
        tokio::spawn(async move {
            let mut sub = match this.relay.watch_call(&this.room, &link.call_id).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(peer = %link.remote, "Failed to watch call document: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    next = sub.next() => match next {
                        Some(record) => this.on_call_record(&link, record).await,
                        None => break,
                    },
                }
            }
            debug!(peer = %link.remote, "Call watcher stopped");
        });
    }

    /// Listen on the remote side's candidate list for the lifetime of the link.
    pub fn spawn_candidate_listener(&self, link: &Arc<PeerLink>) {
        let this = self.clone();
        let link = Arc::clone(link);
        tokio::spawn(async move {
            let side = link.role.remote_side();
            let mut sub = match this.relay.watch_candidates(&this.room, &link.call_id, side).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(peer = %link.remote, "Failed to watch remote candidates: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    next = sub.next() => match next {
                        Some(candidate) => {
                            if let Some(candidate) = link.admit_remote_candidate(candidate) {
                                apply_candidate(&link, candidate).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(peer = %link.remote, "Candidate listener stopped");
        });
    }
}

async fn apply_candidate(link: &PeerLink, candidate: IceCandidatePayload) {
    if link.is_closed() {
        return;
    }
    if let Err(e) = link.transport.add_ice_candidate(candidate).await {
        debug!(peer = %link.remote, "Remote candidate rejected: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use vortex_protocol::{CandidateSide, Role};

    use super::*;
    use crate::memory_relay::MemoryRelay;
    use crate::connection::ConnectionState;
    use crate::testing::FakeTransport;
    use crate::transport::{MediaTransport, TransportEvent};

    const ROOM: &str = "room-1";

    fn candidate(tag: &str) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:{tag} 1 udp 1 10.0.0.1 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Seed the call document the way the caller would have.
    async fn seed_offer(relay: &MemoryRelay, link: &PeerLink, sdp: &str) -> SessionDescription {
        relay
            .merge_call(
                ROOM,
                &link.call_id,
                CallPatch::offer(&PeerId::from("a"), &PeerId::from("b"), sdp),
            )
            .await
            .unwrap();
        SessionDescription::offer(sdp)
    }

    fn link(local: &str, remote: &str) -> (Arc<PeerLink>, Arc<FakeTransport>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let fake = FakeTransport::new(format!("{local}->{remote}"), tx);
        let transport: Arc<dyn MediaTransport> = fake.clone();
        let link = Arc::new(PeerLink::new(&PeerId::from(local), PeerId::from(remote), transport, 1));
        (link, fake)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn offer_answer_exchange_completes() {
        let relay = Arc::new(MemoryRelay::new());
        let a = Handshake::new(relay.clone(), ROOM, PeerId::from("a"));
        let b = Handshake::new(relay.clone(), ROOM, PeerId::from("b"));
        let (a_link, a_fake) = link("a", "b");
        let (b_link, b_fake) = link("b", "a");
        assert_eq!(a_link.role, Role::Caller);

        a.spawn_candidate_listener(&a_link);
        b.spawn_candidate_listener(&b_link);
        a.create_offer(&a_link).await.unwrap();
        a.publish_candidate(&a_link, candidate("a")).await.unwrap();

        let record = relay.get_call(ROOM, &a_link.call_id).await.unwrap().unwrap();
        assert!(b.handle_offer(&b_link, record.offer.unwrap()).await.unwrap());
        b.publish_candidate(&b_link, candidate("b")).await.unwrap();
        settle().await;

        assert_eq!(a_fake.signaling_state(), SignalingState::Stable);
        assert_eq!(b_fake.signaling_state(), SignalingState::Stable);
        assert_eq!(a_fake.offers_created(), 1);
        assert_eq!(b_fake.offers_created(), 0);
        // Each side received the other's candidate once a remote description existed.
        assert_eq!(a_fake.applied_candidates(), vec![candidate("b")]);
        assert_eq!(b_fake.applied_candidates(), vec![candidate("a")]);
    }

    #[tokio::test]
    async fn duplicate_offer_delivery_is_ignored() {
        let relay = Arc::new(MemoryRelay::with_duplicate_delivery());
        let b = Handshake::new(relay.clone(), ROOM, PeerId::from("b"));
        let (b_link, b_fake) = link("b", "a");
        let offer = seed_offer(&relay, &b_link, "remote-offer").await;

        assert!(b.handle_offer(&b_link, offer.clone()).await.unwrap());
        assert!(!b.handle_offer(&b_link, offer).await.unwrap());
        settle().await;
        assert_eq!(b_fake.answers_created(), 1);
    }

    #[tokio::test]
    async fn offer_mid_negotiation_is_dropped() {
        let relay = Arc::new(MemoryRelay::new());
        let a = Handshake::new(relay.clone(), ROOM, PeerId::from("a"));
        let (a_link, a_fake) = link("a", "b");
        a.create_offer(&a_link).await.unwrap();
        assert_eq!(a_fake.signaling_state(), SignalingState::HaveLocalOffer);

        let handled = a
            .handle_offer(&a_link, SessionDescription::offer("glare"))
            .await
            .unwrap();
        assert!(!handled);
        assert_eq!(a_fake.answers_created(), 0);
    }

    #[tokio::test]
    async fn answer_applies_once_and_only_with_outstanding_offer() {
        let relay = Arc::new(MemoryRelay::new());
        let a = Handshake::new(relay.clone(), ROOM, PeerId::from("a"));
        let (a_link, a_fake) = link("a", "b");

        let stray = SessionDescription::answer("stray");
        assert!(!a.apply_answer(&a_link, stray).await.unwrap());

        a.create_offer(&a_link).await.unwrap();
        relay
            .merge_call(ROOM, &a_link.call_id, CallPatch::answer("remote-answer"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(a_fake.signaling_state(), SignalingState::Stable);
        assert!(a_fake.has_remote_description().await);

        let again = SessionDescription::answer("remote-answer");
        assert!(!a.apply_answer(&a_link, again).await.unwrap());
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_parked() {
        let relay = Arc::new(MemoryRelay::new());
        let b = Handshake::new(relay.clone(), ROOM, PeerId::from("b"));
        let (b_link, b_fake) = link("b", "a");
        b.spawn_candidate_listener(&b_link);
        let offer = seed_offer(&relay, &b_link, "remote-offer").await;

        for _ in 0..2 {
            relay
                .append_candidate(ROOM, &b_link.call_id, CandidateSide::Offer, candidate("a"))
                .await
                .unwrap();
        }
        settle().await;
        assert!(b_fake.applied_candidates().is_empty());

        b.handle_offer(&b_link, offer).await.unwrap();
        assert_eq!(b_fake.applied_candidates(), vec![candidate("a")]);
    }

    #[tokio::test]
    async fn failed_transport_does_not_answer() {
        let relay = Arc::new(MemoryRelay::new());
        let b = Handshake::new(relay.clone(), ROOM, PeerId::from("b"));
        let (b_link, b_fake) = link("b", "a");
        b_fake.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
        let offer = seed_offer(&relay, &b_link, "after-failure").await;

        assert!(!b.handle_offer(&b_link, offer).await.unwrap());
        assert_eq!(b_fake.answers_created(), 0);
        assert!(b_link.negotiated_offers().is_empty());
    }

    #[tokio::test]
    async fn release_leaves_a_call_renegotiated_by_someone_else() {
        let relay = Arc::new(MemoryRelay::new());
        let b = Handshake::new(relay.clone(), ROOM, PeerId::from("b"));
        let (b_link, _fake) = link("b", "a");
        let offer = seed_offer(&relay, &b_link, "first-offer").await;
        b.handle_offer(&b_link, offer).await.unwrap();
        b_link.cancel.cancel();

        // The caller rebuilt its side and wrote a fresh offer.
        seed_offer(&relay, &b_link, "second-offer").await;
        b.release_call(&b_link).await;
        let record = relay.get_call(ROOM, &b_link.call_id).await.unwrap().unwrap();
        assert_eq!(record.offer.unwrap().sdp, "second-offer");

        let (b_next, _fake) = link("b", "a");
        let offer = relay.get_call(ROOM, &b_next.call_id).await.unwrap().unwrap();
        b.handle_offer(&b_next, offer.offer.unwrap()).await.unwrap();
        b.release_call(&b_next).await;
        assert!(!relay.has_call(ROOM, &b_next.call_id).await);
    }

    #[tokio::test]
    async fn closed_link_stops_publishing() {
        let relay = Arc::new(MemoryRelay::new());
        let a = Handshake::new(relay.clone(), ROOM, PeerId::from("a"));
        let (a_link, _fake) = link("a", "b");
        a_link.cancel.cancel();
        assert!(matches!(
            a.create_offer(&a_link).await,
            Err(HandshakeError::Closed(_))
        ));
        assert!(!relay.has_call(ROOM, &a_link.call_id).await);
    }
}
