use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinHandle;
use vortex_protocol::PeerId;

use crate::connection::{ConnectionStateMachine, Layer, PeerLink};
use crate::transport::RemoteTrack;

/// Coordinator-owned record of one live peer connection.
pub struct Connection {
    pub link: Arc<PeerLink>,
    pub machine: ConnectionStateMachine,
    restart_timers: HashMap<Layer, JoinHandle<()>>,
    connect_deadline: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(link: Arc<PeerLink>) -> Self {
        Self {
            link,
            machine: ConnectionStateMachine::new(),
            restart_timers: HashMap::new(),
            connect_deadline: None,
        }
    }

    pub fn arm_timer(&mut self, layer: Layer, timer: JoinHandle<()>) {
        if let Some(previous) = self.restart_timers.insert(layer, timer) {
            previous.abort();
        }
    }

    pub fn disarm_timer(&mut self, layer: Layer) {
        if let Some(timer) = self.restart_timers.remove(&layer) {
            timer.abort();
        }
    }

    pub fn arm_connect_deadline(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.connect_deadline.replace(timer) {
            previous.abort();
        }
    }

    pub fn disarm_connect_deadline(&mut self) {
        if let Some(timer) = self.connect_deadline.take() {
            timer.abort();
        }
    }

    /// Stop every handshake task and pending timer tied to this connection.
    pub fn shut(&mut self) {
        self.link.cancel.cancel();
        for (_, timer) in self.restart_timers.drain() {
            timer.abort();
        }
        self.disarm_connect_deadline();
        self.machine.close();
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a connection to {0} already exists")]
pub struct DuplicateConnection(pub PeerId);

/// At most one connection per remote peer.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PeerId, Connection>,
}

impl ConnectionRegistry {
    pub fn insert(&mut self, connection: Connection) -> Result<(), DuplicateConnection> {
        let peer = connection.link.remote.clone();
        if self.connections.contains_key(&peer) {
            return Err(DuplicateConnection(peer));
        }
        self.connections.insert(peer, connection);
        Ok(())
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    /// Look up a connection only if it is still the incarnation `generation`.
    pub fn current_mut(&mut self, peer: &PeerId, generation: u64) -> Option<&mut Connection> {
        self.connections
            .get_mut(peer)
            .filter(|c| c.link.generation == generation)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<Connection> {
        self.connections.remove(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.connections
            .values()
            .map(|c| Arc::clone(&c.link))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Remote tracks received per peer, deduplicated by track id.
#[derive(Debug, Default)]
pub struct RemoteStreams {
    tracks: BTreeMap<PeerId, Vec<RemoteTrack>>,
}

impl RemoteStreams {
    /// Returns `false` if the track was already known.
    pub fn add(&mut self, peer: &PeerId, track: RemoteTrack) -> bool {
        let list = self.tracks.entry(peer.clone()).or_default();
        if list.iter().any(|t| t.id == track.id) {
            return false;
        }
        list.push(track);
        true
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.tracks.remove(peer).is_some()
    }

    pub fn tracks(&self, peer: &PeerId) -> &[RemoteTrack] {
        self.tracks.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn snapshot(&self) -> BTreeMap<PeerId, Vec<RemoteTrack>> {
        self.tracks.clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::testing::FakeTransport;
    use crate::transport::{MediaTransport, TrackKind};

    fn connection(remote: &str, generation: u64) -> Connection {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn MediaTransport> = FakeTransport::new(remote, tx);
        Connection::new(Arc::new(PeerLink::new(
            &PeerId::from("local"),
            PeerId::from(remote),
            transport,
            generation,
        )))
    }

    #[test]
    fn one_connection_per_peer() {
        let mut registry = ConnectionRegistry::default();
        registry.insert(connection("peer", 1)).unwrap();
        assert!(registry.insert(connection("peer", 2)).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.current_mut(&PeerId::from("peer"), 2).is_none());
        assert!(registry.current_mut(&PeerId::from("peer"), 1).is_some());
    }

    #[tokio::test]
    async fn shut_cancels_link_and_timers() {
        let mut conn = connection("peer", 1);
        let timer = tokio::spawn(std::future::pending::<()>());
        conn.arm_timer(Layer::Ice, timer);
        conn.shut();
        assert!(conn.link.is_closed());
        assert!(conn.restart_timers.is_empty());
    }

    #[test]
    fn remote_tracks_deduplicate() {
        let mut streams = RemoteStreams::default();
        let peer = PeerId::from("peer");
        let track = RemoteTrack {
            id: "audio-1".into(),
            kind: TrackKind::Audio,
            stream_id: "s".into(),
        };
        assert!(streams.add(&peer, track.clone()));
        assert!(!streams.add(&peer, track));
        assert_eq!(streams.tracks(&peer).len(), 1);
        assert!(streams.remove_peer(&peer));
        assert!(streams.tracks(&peer).is_empty());
    }
}
