use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use vortex_protocol::{CallId, IceCandidatePayload, PeerId, Role};

use crate::transport::MediaTransport;

/// High-level lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// States the recovery scan treats as needing a rebuild.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// ICE-layer connectivity, tracked separately because it can diverge from
/// the aggregate connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Which state feed a restart timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Connection,
    Ice,
}

/// What the coordinator must do after feeding a state change in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    None,
    /// Start the grace timer for an ICE restart on this layer.
    ScheduleRestart(Layer),
    /// The layer recovered on its own; drop its pending timer.
    CancelRestart(Layer),
    /// The connection is dead; run teardown.
    Teardown,
}

/// Per-peer lifecycle and ICE-restart policy.
///
/// `connected -> disconnected` is treated as transient: a grace timer is
/// scheduled and, if the layer is still disconnected when it fires, one ICE
/// restart is issued. A disconnect episode (from leaving `connected` until
/// either layer reports connectivity again) gets at most one restart even
/// when both layers go down.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    ice_state: IceState,
    connection_timer: bool,
    ice_timer: bool,
    restarted_this_episode: bool,
    restarts: u32,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::New,
            ice_state: IceState::New,
            connection_timer: false,
            ice_timer: false,
            restarted_this_episode: false,
            restarts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ice_state(&self) -> IceState {
        self.ice_state
    }

    /// ICE restarts issued over the lifetime of this connection.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn timer_mut(&mut self, layer: Layer) -> &mut bool {
        match layer {
            Layer::Connection => &mut self.connection_timer,
            Layer::Ice => &mut self.ice_timer,
        }
    }

    fn schedule(&mut self, layer: Layer) -> StateAction {
        let timer = self.timer_mut(layer);
        if *timer {
            return StateAction::None;
        }
        *timer = true;
        StateAction::ScheduleRestart(layer)
    }

    fn cancel(&mut self, layer: Layer) -> StateAction {
        self.restarted_this_episode = false;
        let timer = self.timer_mut(layer);
        if std::mem::take(timer) {
            StateAction::CancelRestart(layer)
        } else {
            StateAction::None
        }
    }

    pub fn on_connection_state(&mut self, next: ConnectionState) -> StateAction {
        if self.state.is_terminal() || self.state == next {
            return StateAction::None;
        }
        self.state = next;
        match next {
            ConnectionState::New | ConnectionState::Connecting => StateAction::None,
            ConnectionState::Connected => self.cancel(Layer::Connection),
            ConnectionState::Disconnected => self.schedule(Layer::Connection),
            ConnectionState::Failed | ConnectionState::Closed => {
                self.connection_timer = false;
                self.ice_timer = false;
                StateAction::Teardown
            }
        }
    }

    pub fn on_ice_state(&mut self, next: IceState) -> StateAction {
        if self.state.is_terminal() || self.ice_state == next {
            return StateAction::None;
        }
        self.ice_state = next;
        match next {
            IceState::Connected | IceState::Completed => self.cancel(Layer::Ice),
            IceState::Disconnected | IceState::Failed => self.schedule(Layer::Ice),
            IceState::New | IceState::Checking | IceState::Closed => StateAction::None,
        }
    }

    /// Grace timer for `layer` fired. Returns whether to issue the restart now.
    pub fn restart_due(&mut self, layer: Layer) -> bool {
        let timer = self.timer_mut(layer);
        if !std::mem::take(timer) {
            return false;
        }
        let still_down = match layer {
            Layer::Connection => self.state == ConnectionState::Disconnected,
            Layer::Ice => matches!(self.ice_state, IceState::Disconnected | IceState::Failed),
        };
        if !still_down || self.restarted_this_episode {
            return false;
        }
        self.restarted_this_episode = true;
        self.restarts += 1;
        true
    }

    /// Force the terminal state after a local teardown.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.connection_timer = false;
        self.ice_timer = false;
    }
}

/// Negotiation bookkeeping shared between the handshake tasks of one link.
#[derive(Debug, Default)]
struct NegotiationMemo {
    local_offer: Option<String>,
    local_answer: Option<String>,
    handled_remote_offers: HashSet<String>,
    applied_answers: HashSet<String>,
    seen_candidates: HashSet<String>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidatePayload>,
}

/// The shared half of a connection: everything spawned handshake tasks need.
///
/// The coordinator owns the `Connection` entry; tasks hold an `Arc<PeerLink>`
/// and stop once `cancel` fires.
pub struct PeerLink {
    pub remote: PeerId,
    pub role: Role,
    pub call_id: CallId,
    pub transport: Arc<dyn MediaTransport>,
    pub cancel: CancellationToken,
    pub generation: u64,
    pub created_at: Instant,
    call_watch_started: AtomicBool,
    memo: Mutex<NegotiationMemo>,
}

impl PeerLink {
    pub fn new(
        local: &PeerId,
        remote: PeerId,
        transport: Arc<dyn MediaTransport>,
        generation: u64,
    ) -> Self {
        Self {
            role: Role::for_pair(local, &remote),
            call_id: CallId::for_pair(local, &remote),
            remote,
            transport,
            cancel: CancellationToken::new(),
            generation,
            created_at: Instant::now(),
            call_watch_started: AtomicBool::new(false),
            memo: Mutex::new(NegotiationMemo::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True exactly once: the first caller starts the call-document watcher.
    pub(crate) fn claim_call_watch(&self) -> bool {
        !self.call_watch_started.swap(true, Ordering::AcqRel)
    }

    fn with_memo<R>(&self, f: impl FnOnce(&mut NegotiationMemo) -> R) -> R {
        let mut memo = match self.memo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut memo)
    }

    pub(crate) fn record_local_offer(&self, sdp: &str) {
        self.with_memo(|m| m.local_offer = Some(sdp.to_string()));
    }

    pub(crate) fn record_local_answer(&self, sdp: &str) {
        self.with_memo(|m| m.local_answer = Some(sdp.to_string()));
    }

    /// First sighting of a remote offer (not one we wrote ourselves).
    pub(crate) fn take_remote_offer(&self, sdp: &str) -> bool {
        self.with_memo(|m| {
            m.local_offer.as_deref() != Some(sdp) && m.handled_remote_offers.insert(sdp.to_string())
        })
    }

    /// First sighting of a remote answer (not one we wrote ourselves).
    pub(crate) fn take_remote_answer(&self, sdp: &str) -> bool {
        self.with_memo(|m| {
            m.local_answer.as_deref() != Some(sdp) && m.applied_answers.insert(sdp.to_string())
        })
    }

    /// Forget an answer that could not be applied so a redelivery can retry it.
    pub(crate) fn release_remote_answer(&self, sdp: &str) {
        self.with_memo(|m| {
            m.applied_answers.remove(sdp);
        });
    }

    /// Every offer this link wrote or answered.
    pub(crate) fn negotiated_offers(&self) -> Vec<String> {
        self.with_memo(|m| {
            m.local_offer
                .iter()
                .chain(m.handled_remote_offers.iter())
                .cloned()
                .collect()
        })
    }

    pub(crate) fn is_local_offer(&self, sdp: &str) -> bool {
        self.with_memo(|m| m.local_offer.as_deref() == Some(sdp))
    }

    /// Admit a remote candidate. Duplicates are dropped; candidates that arrive
    /// before any remote description are parked until one is set.
    pub(crate) fn admit_remote_candidate(
        &self,
        candidate: IceCandidatePayload,
    ) -> Option<IceCandidatePayload> {
        self.with_memo(|m| {
            if !m.seen_candidates.insert(candidate.candidate.clone()) {
                return None;
            }
            if m.remote_description_set {
                Some(candidate)
            } else {
                m.pending_candidates.push(candidate);
                None
            }
        })
    }

    /// Record that a remote description is in place and hand back the parked candidates.
    pub(crate) fn remote_description_applied(&self) -> Vec<IceCandidatePayload> {
        self.with_memo(|m| {
            m.remote_description_set = true;
            std::mem::take(&mut m.pending_candidates)
        })
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("call_id", &self.call_id)
            .field("generation", &self.generation)
            .finish()
    }
}
