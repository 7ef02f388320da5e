//! In-process transport doubles for coordinator and handshake tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use vortex_protocol::{IceCandidatePayload, PeerId, SdpType, SessionDescription};

use crate::connection::{ConnectionState, IceState};
use crate::transport::{
    EncodingCap, LocalTrack, MediaTransport, SignalingState, TrackKind, TransportCounters,
    TransportError, TransportEvent, TransportFactory,
};

static SDP_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    SDP_SEQ.fetch_add(1, Ordering::Relaxed)
}

struct FakeState {
    signaling: SignalingState,
    connection: ConnectionState,
    remote: Option<SessionDescription>,
    offers: u32,
    answers: u32,
    restarts: u32,
    tracks: Vec<(String, TrackKind)>,
    candidates: Vec<IceCandidatePayload>,
    caps: Vec<(String, EncodingCap)>,
    counters: TransportCounters,
    closed: bool,
}

/// Scripted transport: negotiation moves through the usual signaling states
/// and the connection reports `connected` as soon as an exchange completes.
pub(crate) struct FakeTransport {
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    fail_add_track: bool,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub(crate) fn new(
        label: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        Self::build(label.into(), events, false)
    }

    fn build(
        label: String,
        events: mpsc::UnboundedSender<TransportEvent>,
        fail_add_track: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            label,
            events,
            fail_add_track,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                remote: None,
                offers: 0,
                answers: 0,
                restarts: 0,
                tracks: Vec::new(),
                candidates: Vec::new(),
                caps: Vec::new(),
                counters: TransportCounters::default(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Push an event as if the platform had raised it.
    pub(crate) fn emit(&self, event: TransportEvent) {
        if let TransportEvent::ConnectionState(state) = &event {
            self.lock().connection = *state;
        }
        let _ = self.events.send(event);
    }

    pub(crate) fn offers_created(&self) -> u32 {
        self.lock().offers
    }

    pub(crate) fn answers_created(&self) -> u32 {
        self.lock().answers
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidatePayload> {
        self.lock().candidates.clone()
    }

    pub(crate) fn track_ids(&self) -> Vec<String> {
        self.lock().tracks.iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn caps(&self) -> Vec<(String, EncodingCap)> {
        self.lock().caps.clone()
    }

    pub(crate) fn set_counters(&self, counters: TransportCounters) {
        self.lock().counters = counters;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn connect(&self, state: &mut FakeState) {
        if state.connection == ConnectionState::Connected {
            return;
        }
        state.connection = ConnectionState::Connected;
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Connecting));
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Connected));
        let _ = self.events.send(TransportEvent::IceState(IceState::Connected));
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        if self.fail_add_track && track.kind() == TrackKind::Video {
            return Err(TransportError::Track(format!("{}: scripted failure", self.label)));
        }
        self.lock().tracks.push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool, TransportError> {
        let mut state = self.lock();
        let before = state.tracks.len();
        state.tracks.retain(|(id, _)| id != track_id);
        Ok(state.tracks.len() != before)
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let mut state = self.lock();
        match state.tracks.iter_mut().find(|(_, kind)| *kind == track.kind()) {
            Some(slot) => {
                slot.0 = track.id().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!("offer:{}:{}", self.label, next_seq())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!("answer:{}:{}", self.label, next_seq())))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.lock();
        match desc.kind {
            SdpType::Offer => state.signaling = SignalingState::HaveLocalOffer,
            SdpType::Answer => {
                state.signaling = SignalingState::Stable;
                self.connect(&mut state);
            }
        }
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(IceCandidatePayload {
                candidate: format!("candidate:{}:{}", self.label, next_seq()),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        match desc.kind {
            SdpType::Offer if state.signaling == SignalingState::Stable => {
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            SdpType::Answer if state.signaling == SignalingState::HaveLocalOffer => {
                state.signaling = SignalingState::Stable;
                self.connect(&mut state);
            }
            _ => {
                return Err(TransportError::Negotiation(format!(
                    "{:?} in {:?}",
                    desc.kind, state.signaling
                )));
            }
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(TransportError::Candidate("no remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.lock().restarts += 1;
        Ok(())
    }

    async fn set_encoding_cap(&self, track_id: &str, cap: EncodingCap) -> Result<(), TransportError> {
        self.lock().caps.push((track_id.to_string(), cap));
        Ok(())
    }

    async fn counters(&self) -> TransportCounters {
        self.lock().counters
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closed = true;
        state.connection = ConnectionState::Closed;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps every one it created, per remote peer.
#[derive(Default)]
pub(crate) struct FakeFactory {
    local: String,
    fail_video_tracks: bool,
    created: Mutex<HashMap<PeerId, Vec<Arc<FakeTransport>>>>,
}

impl FakeFactory {
    pub(crate) fn new(local: &str) -> Arc<Self> {
        Arc::new(Self {
            local: local.to_string(),
            ..Default::default()
        })
    }

    /// Every transport rejects video tracks.
    pub(crate) fn rejecting_video(local: &str) -> Arc<Self> {
        Arc::new(Self {
            local: local.to_string(),
            fail_video_tracks: true,
            ..Default::default()
        })
    }

    /// Most recent transport created toward `remote`.
    pub(crate) fn latest(&self, remote: &str) -> Option<Arc<FakeTransport>> {
        self.created
            .lock()
            .unwrap()
            .get(&PeerId::from(remote))
            .and_then(|list| list.last().cloned())
    }

    pub(crate) fn created_for(&self, remote: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .get(&PeerId::from(remote))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let fake = FakeTransport::build(
            format!("{}->{remote}", self.local),
            events,
            self.fail_video_tracks,
        );
        self.created
            .lock()
            .unwrap()
            .entry(remote.clone())
            .or_default()
            .push(Arc::clone(&fake));
        Ok(fake)
    }
}
