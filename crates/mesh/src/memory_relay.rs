use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use vortex_protocol::{
    CallId, CallPatch, CallRecord, CandidateSide, IceCandidatePayload, Participant,
    ParticipantPatch, PeerId, call_path, participant_path,
};

use crate::relay::{RelayError, SignalingRelay, Subscription};

type Listeners<T> = Vec<mpsc::UnboundedSender<T>>;

/// Send to every live listener, dropping the ones whose receiver is gone.
fn fan_out<T: Clone>(listeners: &mut Listeners<T>, value: &T, copies: usize) {
    listeners.retain(|tx| (0..copies).all(|_| tx.send(value.clone()).is_ok()));
}

#[derive(Default)]
struct CallDoc {
    record: Option<CallRecord>,
    offer_candidates: Vec<IceCandidatePayload>,
    answer_candidates: Vec<IceCandidatePayload>,
    listeners: Listeners<CallRecord>,
    offer_listeners: Listeners<IceCandidatePayload>,
    answer_listeners: Listeners<IceCandidatePayload>,
}

impl CallDoc {
    fn candidates(&mut self, side: CandidateSide) -> &mut Vec<IceCandidatePayload> {
        match side {
            CandidateSide::Offer => &mut self.offer_candidates,
            CandidateSide::Answer => &mut self.answer_candidates,
        }
    }

    fn candidate_listeners(&mut self, side: CandidateSide) -> &mut Listeners<IceCandidatePayload> {
        match side {
            CandidateSide::Offer => &mut self.offer_listeners,
            CandidateSide::Answer => &mut self.answer_listeners,
        }
    }

    fn is_empty(&self) -> bool {
        self.record.is_none()
            && self.offer_candidates.is_empty()
            && self.answer_candidates.is_empty()
    }

    fn is_watched(&self) -> bool {
        self.listeners.iter().any(|tx| !tx.is_closed())
            || self.offer_listeners.iter().any(|tx| !tx.is_closed())
            || self.answer_listeners.iter().any(|tx| !tx.is_closed())
    }
}

#[derive(Default)]
struct RoomState {
    participants: BTreeMap<PeerId, Participant>,
    calls: HashMap<CallId, CallDoc>,
    participant_listeners: Listeners<Vec<Participant>>,
    incoming_listeners: Vec<(PeerId, mpsc::UnboundedSender<CallRecord>)>,
}

impl RoomState {
    fn snapshot(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    fn publish_participants(&mut self, copies: usize) {
        let snapshot = self.snapshot();
        fan_out(&mut self.participant_listeners, &snapshot, copies);
    }

    fn publish_call(&mut self, call: &CallId, copies: usize) {
        let Some(doc) = self.calls.get_mut(call) else {
            return;
        };
        let Some(record) = doc.record.clone() else {
            return;
        };
        fan_out(&mut doc.listeners, &record, copies);
        self.incoming_listeners.retain(|(callee, tx)| {
            if *callee != record.callee_id {
                return !tx.is_closed();
            }
            (0..copies).all(|_| tx.send(record.clone()).is_ok())
        });
    }

    fn is_idle(&self) -> bool {
        self.participants.is_empty()
            && self.calls.values().all(|doc| doc.is_empty() && !doc.is_watched())
            && self.participant_listeners.iter().all(|tx| tx.is_closed())
            && self.incoming_listeners.iter().all(|(_, tx)| tx.is_closed())
    }
}

fn remove_call_doc(
    rooms: &mut HashMap<String, RoomState>,
    room: &str,
    call: &CallId,
) -> Result<(), RelayError> {
    let not_found = || RelayError::NotFound(call_path(room, call));
    let state = rooms.get_mut(room).ok_or_else(not_found)?;
    let doc = state.calls.get_mut(call).ok_or_else(not_found)?;
    if doc.is_empty() {
        return Err(not_found());
    }
    doc.record = None;
    doc.offer_candidates.clear();
    doc.answer_candidates.clear();
    if !doc.is_watched() {
        state.calls.remove(call);
    }
    if state.is_idle() {
        rooms.remove(room);
    }
    debug!(room, %call, "Call document deleted");
    Ok(())
}

/// Process-local relay: rooms live in memory for as long as the relay does.
///
/// Listeners on a call document outlive its deletion and see it again if it is
/// recreated, the way document-store snapshot listeners behave.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<RwLock<HashMap<String, RoomState>>>,
    copies: usize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            rooms: Arc::default(),
            copies: 1,
        }
    }

    /// Deliver every notification twice, to exercise at-least-once consumers.
    pub fn with_duplicate_delivery() -> Self {
        Self {
            rooms: Arc::default(),
            copies: 2,
        }
    }

    fn copies(&self) -> usize {
        self.copies.max(1)
    }

    /// Whether a call document currently exists.
    pub async fn has_call(&self, room: &str, call: &CallId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room)
            .and_then(|r| r.calls.get(call))
            .is_some_and(|doc| doc.record.is_some())
    }

    /// Ids of every call document present in a room.
    pub async fn call_ids(&self, room: &str) -> Vec<CallId> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<CallId> = rooms
            .get(room)
            .map(|r| {
                r.calls
                    .iter()
                    .filter(|(_, doc)| doc.record.is_some())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub async fn candidate_count(&self, room: &str, call: &CallId, side: CandidateSide) -> usize {
        let mut rooms = self.rooms.write().await;
        rooms
            .get_mut(room)
            .and_then(|r| r.calls.get_mut(call))
            .map(|doc| doc.candidates(side).len())
            .unwrap_or(0)
    }

    pub async fn participants(&self, room: &str) -> Vec<Participant> {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(RoomState::snapshot).unwrap_or_default()
    }

    pub async fn room_exists(&self, room: &str) -> bool {
        self.rooms.read().await.contains_key(room)
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn merge_call(
        &self,
        room: &str,
        call: &CallId,
        patch: CallPatch,
    ) -> Result<(), RelayError> {
        let copies = self.copies();
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room.to_string()).or_default();
        let doc = state.calls.entry(call.clone()).or_default();
        match doc.record.as_mut() {
            Some(record) => record.apply(&patch),
            None => {
                doc.record = Some(CallRecord::from_patch(&patch).ok_or_else(|| {
                    RelayError::NotFound(call_path(room, call))
                })?);
            }
        }
        state.publish_call(call, copies);
        Ok(())
    }

    async fn get_call(&self, room: &str, call: &CallId) -> Result<Option<CallRecord>, RelayError> {
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(room)
            .and_then(|r| r.calls.get(call))
            .and_then(|doc| doc.record.clone()))
    }

    async fn delete_call(&self, room: &str, call: &CallId) -> Result<(), RelayError> {
        let mut rooms = self.rooms.write().await;
        remove_call_doc(&mut rooms, room, call)
    }

    async fn delete_call_if_offer(
        &self,
        room: &str,
        call: &CallId,
        offers: &[String],
    ) -> Result<bool, RelayError> {
        let mut rooms = self.rooms.write().await;
        let owned = rooms
            .get(room)
            .and_then(|r| r.calls.get(call))
            .and_then(|doc| doc.record.as_ref())
            .map(|record| {
                record
                    .offer
                    .as_ref()
                    .is_none_or(|offer| offers.iter().any(|sdp| *sdp == offer.sdp))
            });
        match owned {
            Some(false) => Ok(false),
            Some(true) => remove_call_doc(&mut rooms, room, call).map(|()| true),
            None => Err(RelayError::NotFound(call_path(room, call))),
        }
    }

    async fn append_candidate(
        &self,
        room: &str,
        call: &CallId,
        side: CandidateSide,
        candidate: IceCandidatePayload,
    ) -> Result<(), RelayError> {
        let copies = self.copies();
        let mut rooms = self.rooms.write().await;
        let doc = rooms
            .entry(room.to_string())
            .or_default()
            .calls
            .entry(call.clone())
            .or_default();
        doc.candidates(side).push(candidate.clone());
        fan_out(doc.candidate_listeners(side), &candidate, copies);
        Ok(())
    }

    async fn watch_call(
        &self,
        room: &str,
        call: &CallId,
    ) -> Result<Subscription<CallRecord>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let doc = rooms
            .entry(room.to_string())
            .or_default()
            .calls
            .entry(call.clone())
            .or_default();
        if let Some(record) = &doc.record {
            let _ = tx.send(record.clone());
        }
        doc.listeners.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn watch_candidates(
        &self,
        room: &str,
        call: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidatePayload>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let doc = rooms
            .entry(room.to_string())
            .or_default()
            .calls
            .entry(call.clone())
            .or_default();
        for existing in doc.candidates(side).iter() {
            let _ = tx.send(existing.clone());
        }
        doc.candidate_listeners(side).push(tx);
        Ok(Subscription::new(rx))
    }

    async fn watch_incoming_calls(
        &self,
        room: &str,
        callee: &PeerId,
    ) -> Result<Subscription<CallRecord>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room.to_string()).or_default();
        for doc in state.calls.values() {
            if let Some(record) = &doc.record
                && record.callee_id == *callee
            {
                let _ = tx.send(record.clone());
            }
        }
        state.incoming_listeners.push((callee.clone(), tx));
        Ok(Subscription::new(rx))
    }

    async fn upsert_participant(
        &self,
        room: &str,
        participant: Participant,
    ) -> Result<(), RelayError> {
        let copies = self.copies();
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room.to_string()).or_default();
        state
            .participants
            .insert(participant.id.clone(), participant);
        state.publish_participants(copies);
        Ok(())
    }

    async fn update_participant(
        &self,
        room: &str,
        peer: &PeerId,
        patch: ParticipantPatch,
    ) -> Result<(), RelayError> {
        let copies = self.copies();
        let mut rooms = self.rooms.write().await;
        let state = rooms
            .get_mut(room)
            .ok_or_else(|| RelayError::NotFound(participant_path(room, peer)))?;
        let participant = state
            .participants
            .get_mut(peer)
            .ok_or_else(|| RelayError::NotFound(participant_path(room, peer)))?;
        participant.apply(&patch);
        state.publish_participants(copies);
        Ok(())
    }

    async fn remove_participant(&self, room: &str, peer: &PeerId) -> Result<(), RelayError> {
        let copies = self.copies();
        let mut rooms = self.rooms.write().await;
        let Some(state) = rooms.get_mut(room) else {
            return Err(RelayError::NotFound(participant_path(room, peer)));
        };
        if state.participants.remove(peer).is_none() {
            return Err(RelayError::NotFound(participant_path(room, peer)));
        }
        state.publish_participants(copies);

        // Last one out clears the room's signaling state.
        if state.participants.is_empty() {
            state.calls.retain(|_, doc| {
                doc.record = None;
                doc.offer_candidates.clear();
                doc.answer_candidates.clear();
                doc.is_watched()
            });
        }
        if state.is_idle() {
            rooms.remove(room);
            debug!(room, "Room removed");
        }
        Ok(())
    }

    async fn watch_participants(
        &self,
        room: &str,
    ) -> Result<Subscription<Vec<Participant>>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room.to_string()).or_default();
        let _ = tx.send(state.snapshot());
        state.participant_listeners.push(tx);
        Ok(Subscription::new(rx))
    }
}
