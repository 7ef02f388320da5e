use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use vortex_protocol::{
    CallId, CallRecord, Participant, ParticipantPatch, PeerId, Role, VortexConfig,
};

use crate::audio::vad::{RemoteVoiceActivity, VoiceActivity};
use crate::connection::{ConnectionState, Layer, PeerLink, StateAction};
use crate::handshake::Handshake;
use crate::registry::{Connection, ConnectionRegistry, DuplicateConnection, RemoteStreams};
use crate::relay::{RelayError, SignalingRelay, Subscription};
use crate::screen_share::{ScreenShareController, ShareBudget, ShareError};
use crate::stats::TransportSource;
use crate::transport::{
    EncodingCap, LocalTrack, MediaTransport, RemoteTrack, TrackKind, TransportError,
    TransportEvent, TransportFactory,
};

/// Remote audio RMS above which a peer counts as speaking.
const REMOTE_VOICE_THRESHOLD: f32 = 0.01;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh session closed")]
    Closed,
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Duplicate(#[from] DuplicateConnection),
}

/// Per-session settings for one participant.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub room: String,
    pub local: PeerId,
    pub display_name: Option<String>,
    pub sub_room: String,
    pub restart_grace: Duration,
    /// A link still short of `connected` after this long is rebuilt.
    pub connect_timeout: Duration,
    pub track_update_delay: Duration,
    pub share: ShareBudget,
}

impl MeshOptions {
    pub fn new(room: impl Into<String>, local: PeerId, config: &VortexConfig) -> Self {
        Self {
            room: room.into(),
            local,
            display_name: None,
            sub_room: config.room.default_sub_room.clone(),
            restart_grace: Duration::from_millis(config.connection.ice_restart_grace_ms),
            connect_timeout: Duration::from_millis(config.connection.connect_timeout_ms),
            track_update_delay: Duration::from_millis(config.connection.track_update_delay_ms),
            share: ShareBudget::from(&config.screen_share),
        }
    }
}

/// What observers (UI, logs) see of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshSnapshot {
    pub sub_room: String,
    pub connections: BTreeMap<PeerId, ConnectionState>,
    pub remote_streams: BTreeMap<PeerId, Vec<RemoteTrack>>,
    pub remote_presenter: Option<PeerId>,
    pub sharing: bool,
    pub share_cap: Option<EncodingCap>,
    pub voice: BTreeMap<PeerId, VoiceActivity>,
    pub muted: bool,
    /// Remote playback should be silenced.
    pub deafened: bool,
    pub closed: bool,
}

enum MeshEvent {
    MembershipChanged(Vec<Participant>),
    IncomingCall(CallRecord),
    Transport {
        peer: PeerId,
        generation: Option<u64>,
        event: TransportEvent,
    },
    RestartDue {
        peer: PeerId,
        generation: u64,
        layer: Layer,
    },
    ConnectDeadline {
        peer: PeerId,
        generation: u64,
    },
    MoveToSubRoom(String, oneshot::Sender<Result<(), MeshError>>),
    StartScreenShare(LocalTrack, oneshot::Sender<Result<EncodingCap, MeshError>>),
    StopScreenShare(oneshot::Sender<bool>),
    ScreenShareEnded { track_id: String },
    ReplaceAudioTrack(LocalTrack, oneshot::Sender<()>),
    UpdatePresence(ParticipantPatch, oneshot::Sender<Result<(), MeshError>>),
    Reevaluate,
    Transports(oneshot::Sender<Vec<Arc<dyn MediaTransport>>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`MeshCoordinator`].
#[derive(Clone)]
pub struct MeshHandle {
    inbox: mpsc::UnboundedSender<MeshEvent>,
    snapshot: watch::Receiver<MeshSnapshot>,
    local: PeerId,
}

impl MeshHandle {
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    fn send(&self, event: MeshEvent) -> Result<(), MeshError> {
        self.inbox.send(event).map_err(|_| MeshError::Closed)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> MeshEvent,
    ) -> Result<R, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Feed a membership snapshot from an external source.
    pub fn membership_changed(&self, participants: Vec<Participant>) -> Result<(), MeshError> {
        self.send(MeshEvent::MembershipChanged(participants))
    }

    /// Feed a call document addressed to this participant.
    pub fn relay_message(&self, record: CallRecord) -> Result<(), MeshError> {
        self.send(MeshEvent::IncomingCall(record))
    }

    /// Report a connection-state change for the current connection to `peer`.
    pub fn transport_state_changed(
        &self,
        peer: PeerId,
        state: ConnectionState,
    ) -> Result<(), MeshError> {
        self.send(MeshEvent::Transport {
            peer,
            generation: None,
            event: TransportEvent::ConnectionState(state),
        })
    }

    /// Drop broken connections and rebuild the mesh from current membership.
    pub fn reevaluate(&self) -> Result<(), MeshError> {
        self.send(MeshEvent::Reevaluate)
    }

    pub async fn move_to_sub_room(&self, sub_room: impl Into<String>) -> Result<(), MeshError> {
        let sub_room = sub_room.into();
        self.request(|tx| MeshEvent::MoveToSubRoom(sub_room, tx))
            .await?
    }

    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<EncodingCap, MeshError> {
        self.request(|tx| MeshEvent::StartScreenShare(track, tx))
            .await?
    }

    /// Returns whether a share was active.
    pub async fn stop_screen_share(&self) -> Result<bool, MeshError> {
        self.request(MeshEvent::StopScreenShare).await
    }

    pub async fn replace_audio_track(&self, track: LocalTrack) -> Result<(), MeshError> {
        self.request(|tx| MeshEvent::ReplaceAudioTrack(track, tx))
            .await
    }

    /// Mute/deafen/name flags on the participant document. Mute and deafen
    /// are mirrored into the snapshot.
    pub async fn update_presence(&self, patch: ParticipantPatch) -> Result<(), MeshError> {
        self.request(|tx| MeshEvent::UpdatePresence(patch, tx))
            .await?
    }

    /// Leave the room. Idempotent; later calls return once the first completed.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(MeshEvent::Shutdown(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

#[async_trait]
impl TransportSource for MeshHandle {
    async fn transports(&self) -> Vec<Arc<dyn MediaTransport>> {
        self.request(MeshEvent::Transports)
            .await
            .unwrap_or_default()
    }
}

/// Single actor per room session that keeps the set of live connections equal
/// to "every other participant in my sub-room".
///
/// Every mutation of the connection registry and remote streams happens on
/// the actor task. Relay subscriptions, transport callbacks and timers only
/// post [`MeshEvent`]s into its inbox.
pub struct MeshCoordinator {
    options: MeshOptions,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    handshake: Handshake,
    inbox_tx: mpsc::UnboundedSender<MeshEvent>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    session: CancellationToken,
    registry: ConnectionRegistry,
    streams: RemoteStreams,
    voice: RemoteVoiceActivity,
    share: ScreenShareController,
    audio: Option<LocalTrack>,
    members: Vec<Participant>,
    sub_room: String,
    pending_calls: BTreeSet<PeerId>,
    remote_presenter: Option<PeerId>,
    muted: bool,
    deafened: bool,
    generation: u64,
    closed: bool,
}

fn forward<T: Send + 'static>(
    mut sub: Subscription<T>,
    inbox: mpsc::UnboundedSender<MeshEvent>,
    cancel: CancellationToken,
    wrap: fn(T) -> MeshEvent,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = sub.next() => match next {
                    Some(value) => {
                        if inbox.send(wrap(value)).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MeshCoordinator {
    /// Join the room and start the coordinator actor.
    ///
    /// `audio` is the shared outgoing audio track attached to every connection.
    pub async fn start(
        options: MeshOptions,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        audio: Option<LocalTrack>,
    ) -> Result<MeshHandle, MeshError> {
        let room = options.room.clone();
        let local = options.local.clone();

        let mut me = Participant::new(local.clone(), options.sub_room.clone());
        me.name = options.display_name.clone();
        me.joined_at = unix_millis();
        relay.upsert_participant(&room, me).await?;

        let subscriptions = async {
            let members = relay.watch_participants(&room).await?;
            let incoming = relay.watch_incoming_calls(&room, &local).await?;
            Ok::<_, RelayError>((members, incoming))
        };
        let (members, incoming) = match subscriptions.await {
            Ok(subs) => subs,
            Err(e) => {
                if let Err(cleanup) = relay.remove_participant(&room, &local).await {
                    debug!("Participant cleanup after failed join: {cleanup}");
                }
                return Err(e.into());
            }
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let session = CancellationToken::new();
        forward(members, inbox_tx.clone(), session.clone(), MeshEvent::MembershipChanged);
        forward(incoming, inbox_tx.clone(), session.clone(), MeshEvent::IncomingCall);

        let initial = MeshSnapshot {
            sub_room: options.sub_room.clone(),
            ..Default::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let handle = MeshHandle {
            inbox: inbox_tx.clone(),
            snapshot: snapshot_rx,
            local: local.clone(),
        };

        let coordinator = MeshCoordinator {
            handshake: Handshake::new(Arc::clone(&relay), room.clone(), local.clone()),
            share: ScreenShareController::new(options.share),
            sub_room: options.sub_room.clone(),
            options,
            relay,
            factory,
            inbox_tx,
            snapshot_tx,
            session,
            registry: ConnectionRegistry::default(),
            streams: RemoteStreams::default(),
            voice: RemoteVoiceActivity::new(REMOTE_VOICE_THRESHOLD),
            audio,
            members: Vec::new(),
            pending_calls: BTreeSet::new(),
            remote_presenter: None,
            muted: false,
            deafened: false,
            generation: 0,
            closed: false,
        };
        info!(%room, peer = %local, "Joined room");
        tokio::spawn(
            coordinator
                .run(inbox_rx)
                .instrument(info_span!("mesh", peer = %local)),
        );
        Ok(handle)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<MeshEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                MeshEvent::MembershipChanged(participants) => {
                    self.members = participants;
                    self.reconcile().await;
                }
                MeshEvent::IncomingCall(record) => self.on_incoming_call(record).await,
                MeshEvent::Transport {
                    peer,
                    generation,
                    event,
                } => self.on_transport_event(peer, generation, event).await,
                MeshEvent::RestartDue {
                    peer,
                    generation,
                    layer,
                } => self.on_restart_due(&peer, generation, layer).await,
                MeshEvent::ConnectDeadline { peer, generation } => {
                    self.on_connect_deadline(&peer, generation).await
                }
                MeshEvent::MoveToSubRoom(sub_room, reply) => {
                    let _ = reply.send(self.move_to_sub_room(sub_room).await);
                }
                MeshEvent::StartScreenShare(track, reply) => {
                    let _ = reply.send(self.start_share(track).await);
                }
                MeshEvent::StopScreenShare(reply) => {
                    let _ = reply.send(self.stop_share().await);
                }
                MeshEvent::ScreenShareEnded { track_id } => {
                    if self.share.track().is_some_and(|t| t.id() == track_id) {
                        info!("Screen capture ended by the system");
                        self.stop_share().await;
                    }
                }
                MeshEvent::ReplaceAudioTrack(track, reply) => {
                    self.replace_audio_track(track).await;
                    let _ = reply.send(());
                }
                MeshEvent::UpdatePresence(patch, reply) => {
                    let _ = reply.send(self.update_presence(patch).await);
                }
                MeshEvent::Reevaluate => self.reevaluate().await,
                MeshEvent::Transports(reply) => {
                    let transports = self
                        .registry
                        .iter()
                        .map(|c| Arc::clone(&c.link.transport))
                        .collect();
                    let _ = reply.send(transports);
                }
                MeshEvent::Shutdown(reply) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("Mesh coordinator stopped");
    }

    fn in_my_sub_room(&self, peer: &PeerId) -> bool {
        self.members
            .iter()
            .any(|p| &p.id == peer && p.sub_room == self.sub_room)
    }

    fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            sub_room: self.sub_room.clone(),
            connections: self
                .registry
                .iter()
                .map(|c| (c.link.remote.clone(), c.machine.state()))
                .collect(),
            remote_streams: self.streams.snapshot(),
            remote_presenter: self.remote_presenter.clone(),
            sharing: self.share.is_active(),
            share_cap: self.share.cap(),
            voice: self.voice.snapshot(),
            muted: self.muted,
            deafened: self.deafened,
            closed: self.closed,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Bring the connection set in line with "peers in my sub-room".
    async fn reconcile(&mut self) {
        if self.closed {
            return;
        }
        let local = self.options.local.clone();
        let desired: BTreeSet<PeerId> = self
            .members
            .iter()
            .filter(|p| p.sub_room == self.sub_room && p.id != local)
            .map(|p| p.id.clone())
            .collect();

        for peer in self.registry.peers() {
            if !desired.contains(&peer) {
                info!(peer = %peer, "Peer left the sub-room");
                self.teardown(&peer).await;
            }
        }

        for peer in &desired {
            if self.registry.contains(peer) {
                continue;
            }
            match Role::for_pair(&local, peer) {
                Role::Caller => self.call(peer).await,
                Role::Callee => {
                    if self.pending_calls.remove(peer) {
                        self.accept(peer).await;
                    }
                }
            }
        }

        let in_room: HashSet<&PeerId> = self.members.iter().map(|p| &p.id).collect();
        self.pending_calls.retain(|peer| in_room.contains(peer));

        self.remote_presenter = self
            .members
            .iter()
            .find(|p| p.sub_room == self.sub_room && p.id != local && p.is_screen_sharing)
            .map(|p| p.id.clone());

        self.settle().await;
    }

    async fn settle(&mut self) {
        let links = self.registry.links();
        self.share.viewers_changed(&links).await;
        self.publish();
    }

    async fn open_connection(&mut self, peer: &PeerId) -> Result<Arc<PeerLink>, MeshError> {
        self.generation += 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(peer, events_tx).await?;
        let link = Arc::new(PeerLink::new(
            &self.options.local,
            peer.clone(),
            transport,
            self.generation,
        ));

        if let Err(e) = self.registry.insert(Connection::new(Arc::clone(&link))) {
            link.cancel.cancel();
            if let Err(close) = link.transport.close().await {
                debug!(peer = %peer, "Closing duplicate transport: {close}");
            }
            return Err(e.into());
        }

        self.arm_connect_deadline(&link);
        self.spawn_event_pump(&link, events_rx);
        self.handshake.spawn_candidate_listener(&link);
        if let Some(audio) = &self.audio {
            if let Err(e) = link.transport.add_track(audio).await {
                warn!(peer = %peer, "Failed to attach audio track: {e}");
            }
        }
        if let Err(e) = self.share.attach(&link).await {
            warn!(peer = %peer, "Failed to attach screen share: {e}");
        }
        debug!(peer = %peer, role = ?link.role, generation = link.generation, "Connection created");
        Ok(link)
    }

    fn arm_connect_deadline(&mut self, link: &PeerLink) {
        let inbox = self.inbox_tx.clone();
        let timeout = self.options.connect_timeout;
        let peer = link.remote.clone();
        let generation = link.generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(MeshEvent::ConnectDeadline { peer, generation });
        });
        if let Some(conn) = self.registry.current_mut(&link.remote, generation) {
            conn.arm_connect_deadline(timer);
        } else {
            timer.abort();
        }
    }

    /// Forward transport callbacks of one link: local candidates go straight to
    /// the relay, everything else through the inbox.
    fn spawn_event_pump(
        &self,
        link: &Arc<PeerLink>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let handshake = self.handshake.clone();
        let inbox = self.inbox_tx.clone();
        let link = Arc::clone(link);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        if let Err(e) = handshake.publish_candidate(&link, candidate).await {
                            debug!(peer = %link.remote, "Candidate not published: {e}");
                        }
                    }
                    event => {
                        let forwarded = MeshEvent::Transport {
                            peer: link.remote.clone(),
                            generation: Some(link.generation),
                            event,
                        };
                        if inbox.send(forwarded).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Outbound side of the tie-break: we hold the smaller id.
    async fn call(&mut self, peer: &PeerId) {
        let link = match self.open_connection(peer).await {
            Ok(link) => link,
            Err(e) => {
                warn!(peer = %peer, "Failed to create connection: {e}");
                return;
            }
        };
        info!(peer = %peer, "Calling peer");
        if let Err(e) = self.handshake.create_offer(&link).await {
            warn!(peer = %peer, "Failed to send offer: {e}");
            self.teardown(peer).await;
        }
    }

    /// Answer the offer currently stored in the call document from `caller`.
    async fn accept(&mut self, caller: &PeerId) {
        let call_id = CallId::for_pair(&self.options.local, caller);
        let offer = match self.relay.get_call(&self.options.room, &call_id).await {
            Ok(Some(CallRecord {
                offer: Some(offer), ..
            })) => offer,
            // Stay pending: the caller's next offer, or the next reconcile, retries.
            Ok(_) => {
                debug!(peer = %caller, "Call document has no offer yet, keeping the call pending");
                self.pending_calls.insert(caller.clone());
                return;
            }
            Err(e) => {
                warn!(peer = %caller, "Failed to read call document: {e}");
                self.pending_calls.insert(caller.clone());
                return;
            }
        };
        let link = match self.open_connection(caller).await {
            Ok(link) => link,
            Err(e) => {
                warn!(peer = %caller, "Failed to create connection: {e}");
                return;
            }
        };
        info!(peer = %caller, "Answering call");
        match self.handshake.handle_offer(&link, offer).await {
            Ok(true) => {}
            Ok(false) => debug!(peer = %caller, "Offer already handled"),
            Err(e) => {
                warn!(peer = %caller, "Failed to answer call: {e}");
                self.rebuild(caller).await;
            }
        }
    }

    async fn on_incoming_call(&mut self, record: CallRecord) {
        if self.closed || record.offer.is_none() || record.callee_id != self.options.local {
            return;
        }
        let caller = record.caller_id;
        if Role::for_pair(&caller, &self.options.local) != Role::Caller {
            debug!(peer = %caller, "Ignoring call from a peer that should be answering");
            return;
        }
        // Offers on a live connection are renegotiations; its call watcher handles them.
        if self.registry.contains(&caller) {
            return;
        }
        if !self.in_my_sub_room(&caller) {
            debug!(peer = %caller, "Call from outside my sub-room, holding it");
            self.pending_calls.insert(caller);
            return;
        }
        self.pending_calls.remove(&caller);
        self.accept(&caller).await;
        self.settle().await;
    }

    async fn on_transport_event(
        &mut self,
        peer: PeerId,
        generation: Option<u64>,
        event: TransportEvent,
    ) {
        let current = self.registry.get(&peer).map(|c| c.link.generation);
        let Some(generation) = generation.or(current).filter(|g| Some(*g) == current) else {
            return;
        };

        let action = match event {
            TransportEvent::Track(track) => {
                if track.kind == TrackKind::Video && self.remote_presenter.is_none() {
                    self.remote_presenter = Some(peer.clone());
                }
                if self.streams.add(&peer, track) {
                    self.publish();
                }
                return;
            }
            TransportEvent::AudioLevel(level) => {
                if self.voice.update(&peer, level) {
                    self.publish();
                }
                return;
            }
            TransportEvent::LocalCandidate(_) => return,
            TransportEvent::ConnectionState(state) => {
                let Some(conn) = self.registry.current_mut(&peer, generation) else {
                    return;
                };
                info!(peer = %peer, ?state, "Connection state changed");
                if state == ConnectionState::Connected {
                    conn.disarm_connect_deadline();
                }
                conn.machine.on_connection_state(state)
            }
            TransportEvent::IceState(state) => {
                let Some(conn) = self.registry.current_mut(&peer, generation) else {
                    return;
                };
                debug!(peer = %peer, ?state, "ICE state changed");
                conn.machine.on_ice_state(state)
            }
        };

        match action {
            StateAction::None => {}
            StateAction::ScheduleRestart(layer) => {
                let inbox = self.inbox_tx.clone();
                let grace = self.options.restart_grace;
                let timer_peer = peer.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = inbox.send(MeshEvent::RestartDue {
                        peer: timer_peer,
                        generation,
                        layer,
                    });
                });
                if let Some(conn) = self.registry.current_mut(&peer, generation) {
                    conn.arm_timer(layer, timer);
                }
                debug!(peer = %peer, ?layer, ?grace, "ICE restart scheduled");
            }
            StateAction::CancelRestart(layer) => {
                if let Some(conn) = self.registry.current_mut(&peer, generation) {
                    conn.disarm_timer(layer);
                }
                info!(peer = %peer, ?layer, "Recovered without ICE restart");
            }
            StateAction::Teardown => {
                self.rebuild(&peer).await;
                self.reconcile().await;
                return;
            }
        }
        self.publish();
    }

    async fn on_restart_due(&mut self, peer: &PeerId, generation: u64, layer: Layer) {
        let Some(conn) = self.registry.current_mut(peer, generation) else {
            return;
        };
        conn.disarm_timer(layer);
        if !conn.machine.restart_due(layer) {
            return;
        }
        let link = Arc::clone(&conn.link);
        // Only the caller offers; the callee picks the restart up from that offer.
        if link.role == Role::Callee {
            info!(peer = %peer, ?layer, "Still disconnected, waiting for the caller's ICE restart");
            return;
        }
        warn!(peer = %peer, ?layer, "Still disconnected after grace period, restarting ICE");
        if let Err(e) = link.transport.restart_ice().await {
            warn!(peer = %peer, "ICE restart failed: {e}");
            return;
        }
        if let Err(e) = self.handshake.create_offer(&link).await {
            warn!(peer = %peer, "ICE restart offer failed: {e}");
        }
    }

    async fn on_connect_deadline(&mut self, peer: &PeerId, generation: u64) {
        let Some(conn) = self.registry.current_mut(peer, generation) else {
            return;
        };
        conn.disarm_connect_deadline();
        let state = conn.machine.state();
        if !matches!(state, ConnectionState::New | ConnectionState::Connecting) {
            return;
        }
        warn!(
            peer = %peer,
            ?state,
            timeout = ?self.options.connect_timeout,
            "Connection did not come up in time, rebuilding"
        );
        self.rebuild(peer).await;
        self.reconcile().await;
    }

    /// Tear down a dead connection so the next reconcile builds a fresh one:
    /// the caller redials, the callee re-reads the call document.
    async fn rebuild(&mut self, peer: &PeerId) {
        let role = self.registry.get(peer).map(|c| c.link.role);
        if self.teardown(peer).await && role == Some(Role::Callee) {
            self.pending_calls.insert(peer.clone());
        }
    }

    /// Close the connection to `peer` and drop everything tied to it.
    /// Returns `false` when there was nothing to tear down.
    async fn teardown(&mut self, peer: &PeerId) -> bool {
        let Some(mut conn) = self.registry.remove(peer) else {
            return false;
        };
        conn.shut();
        if let Err(e) = conn.link.transport.close().await {
            debug!(peer = %peer, "Transport close: {e}");
        }
        self.streams.remove_peer(peer);
        self.voice.remove(peer);
        if self.remote_presenter.as_ref() == Some(peer) {
            self.remote_presenter = None;
        }
        self.handshake.release_call(&conn.link).await;
        info!(peer = %peer, "Connection closed");
        true
    }

    async fn reevaluate(&mut self) {
        let broken: Vec<PeerId> = self
            .registry
            .iter()
            .filter(|c| {
                c.machine.state().is_broken() || c.link.transport.connection_state().is_broken()
            })
            .map(|c| c.link.remote.clone())
            .collect();
        for peer in &broken {
            warn!(peer = %peer, "Rebuilding broken connection");
            self.rebuild(peer).await;
        }
        self.reconcile().await;
    }

    async fn move_to_sub_room(&mut self, sub_room: String) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::Closed);
        }
        if sub_room == self.sub_room {
            return Ok(());
        }
        let local = self.options.local.clone();
        self.relay
            .update_participant(
                &self.options.room,
                &local,
                ParticipantPatch {
                    sub_room: Some(sub_room.clone()),
                    ..Default::default()
                },
            )
            .await?;
        // A share is scoped to the sub-room it started in.
        if self.share.is_active() {
            self.stop_share().await;
        }
        info!(from = %self.sub_room, to = %sub_room, "Moving to sub-room");
        if let Some(me) = self.members.iter_mut().find(|p| p.id == local) {
            me.sub_room = sub_room.clone();
        }
        self.sub_room = sub_room;
        self.reconcile().await;
        Ok(())
    }

    async fn set_sharing_flag(&self, sharing: bool) {
        let patch = ParticipantPatch {
            is_screen_sharing: Some(sharing),
            ..Default::default()
        };
        if let Err(e) = self
            .relay
            .update_participant(&self.options.room, &self.options.local, patch)
            .await
        {
            warn!("Failed to publish screen-share flag: {e}");
        }
    }

    async fn start_share(&mut self, track: LocalTrack) -> Result<EncodingCap, MeshError> {
        if self.closed {
            return Err(MeshError::Closed);
        }
        let links = self.registry.links();
        let cap = self
            .share
            .start(
                track.clone(),
                self.remote_presenter.as_ref(),
                &links,
                &self.handshake,
            )
            .await?;
        self.set_sharing_flag(true).await;

        let inbox = self.inbox_tx.clone();
        let session = self.session.clone();
        let track_id = track.id().to_string();
        let ended = track.ended();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled() => {}
                _ = ended => {
                    let _ = inbox.send(MeshEvent::ScreenShareEnded { track_id });
                }
            }
        });
        self.publish();
        Ok(cap)
    }

    async fn stop_share(&mut self) -> bool {
        let links = self.registry.links();
        if self.share.stop(&links, &self.handshake).await.is_none() {
            return false;
        }
        self.set_sharing_flag(false).await;
        self.publish();
        true
    }

    /// Swap the outgoing audio on every connection: in place where a sender
    /// exists, otherwise add it and renegotiate after a short delay.
    async fn replace_audio_track(&mut self, track: LocalTrack) {
        for link in self.registry.links() {
            match link.transport.replace_track(&track).await {
                Ok(true) => debug!(peer = %link.remote, "Audio track replaced in place"),
                Ok(false) => {
                    if let Err(e) = link.transport.add_track(&track).await {
                        warn!(peer = %link.remote, "Failed to add audio track: {e}");
                        continue;
                    }
                    let handshake = self.handshake.clone();
                    let delay = self.options.track_update_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = handshake.create_offer(&link).await {
                            warn!(peer = %link.remote, "Renegotiation after audio change failed: {e}");
                        }
                    });
                }
                Err(e) => warn!(peer = %link.remote, "Failed to replace audio track: {e}"),
            }
        }
        self.audio = Some(track);
    }

    async fn update_presence(&mut self, patch: ParticipantPatch) -> Result<(), MeshError> {
        let muted = patch.is_muted;
        let deafened = patch.is_deafened;
        self.relay
            .update_participant(&self.options.room, &self.options.local, patch)
            .await?;
        // Unmuting clears deafen; deafening implies mute.
        if let Some(muted) = muted {
            self.muted = muted;
            if !muted {
                self.deafened = false;
            }
        }
        if let Some(deafened) = deafened {
            self.deafened = deafened;
            if deafened {
                self.muted = true;
            }
        }
        self.publish();
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.cancel();
        self.share.abandon();
        for peer in self.registry.peers() {
            self.teardown(&peer).await;
        }
        self.pending_calls.clear();
        if let Err(e) = self
            .relay
            .remove_participant(&self.options.room, &self.options.local)
            .await
        {
            debug!("Participant removal on leave: {e}");
        }
        self.publish();
        info!(room = %self.options.room, "Left room");
    }
}
