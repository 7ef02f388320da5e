use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use vortex_protocol::{IceCandidatePayload, PeerId, SessionDescription};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::connection::{ConnectionState, IceState};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),
    #[error("track operation failed: {0}")]
    Track(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

/// Encoding ceiling for an outgoing video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingCap {
    pub max_bitrate_bps: u32,
    pub max_framerate: u32,
}

/// Cumulative byte counters of one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A track arriving from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Notifications a transport pushes back to the coordinator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidatePayload),
    ConnectionState(ConnectionState),
    IceState(IceState),
    Track(RemoteTrack),
    /// RMS of the most recent decoded remote audio frame
    AudioLevel(f32),
}

/// Locally produced media, shared by every connection that carries it.
///
/// The producer writes encoded samples once; every attached sender forwards
/// them. Video tracks also carry the current encoding cap so the producer can
/// adjust its encoder, and an `ended` token fired when the source goes away
/// (device unplugged, capture stopped by the OS).
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    sample_track: Arc<TrackLocalStaticSample>,
    cap_tx: Arc<watch::Sender<Option<EncodingCap>>>,
    ended: CancellationToken,
}

impl LocalTrack {
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::build(
            id.into(),
            stream_id.into(),
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                ..Default::default()
            },
        )
    }

    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::build(
            id.into(),
            stream_id.into(),
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        )
    }

    fn build(id: String, stream_id: String, kind: TrackKind, codec: RTCRtpCodecCapability) -> Self {
        let sample_track = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id));
        let (cap_tx, _) = watch::channel(None);
        Self {
            id,
            kind,
            sample_track,
            cap_tx: Arc::new(cap_tx),
            ended: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sample_track)
    }

    pub async fn write_sample(&self, data: &[u8], duration: Duration) -> anyhow::Result<()> {
        use anyhow::Context;
        self.sample_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::copy_from_slice(data),
                duration,
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to write {} sample", self.kind.as_str()))?;
        Ok(())
    }

    /// Publish a new encoding cap to whoever feeds this track.
    pub fn apply_cap(&self, cap: EncodingCap) {
        self.cap_tx.send_replace(Some(cap));
    }

    pub fn current_cap(&self) -> Option<EncodingCap> {
        *self.cap_tx.borrow()
    }

    pub fn subscribe_cap(&self) -> watch::Receiver<Option<EncodingCap>> {
        self.cap_tx.subscribe()
    }

    /// Mark the source as gone. Idempotent.
    pub fn end(&self) {
        self.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once the source has ended.
    pub fn ended(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.ended.clone().cancelled_owned()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Platform media-transport primitive for one remote peer.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Remove the sender carrying `track_id`. Returns whether one existed.
    async fn remove_track(&self, track_id: &str) -> Result<bool, TransportError>;

    /// Swap the media of the existing sender of the same kind in place.
    /// Returns `false` when no such sender exists.
    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), TransportError>;

    /// Request fresh ICE credentials; the next offer carries the restart.
    async fn restart_ice(&self) -> Result<(), TransportError>;

    async fn set_encoding_cap(&self, track_id: &str, cap: EncodingCap)
    -> Result<(), TransportError>;

    async fn counters(&self) -> TransportCounters;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates one transport per remote peer, wired to push its events into `events`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_published_to_subscribers() {
        let track = LocalTrack::video("screen", "vortex");
        let rx = track.subscribe_cap();
        assert!(rx.borrow().is_none());
        let cap = EncodingCap {
            max_bitrate_bps: 1_000_000,
            max_framerate: 30,
        };
        track.apply_cap(cap);
        assert_eq!(*rx.borrow(), Some(cap));
        assert_eq!(track.current_cap(), Some(cap));
    }

    #[tokio::test]
    async fn ended_resolves_for_every_clone() {
        let track = LocalTrack::audio("mic", "vortex");
        let clone = track.clone();
        let waiter = tokio::spawn(clone.ended());
        track.end();
        track.end();
        waiter.await.unwrap();
        assert!(track.is_ended());
    }
}
