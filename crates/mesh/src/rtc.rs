use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use audiopus::coder::Decoder as OpusDecoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use vortex_protocol::{IceCandidatePayload, IceServerConfig, PeerId, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::levels::rms_i16;
use crate::connection::{ConnectionState, IceState};
use crate::transport::{
    EncodingCap, LocalTrack, MediaTransport, RemoteTrack, SignalingState, TrackKind,
    TransportCounters, TransportError, TransportEvent,
};

/// Decoded remote frames between two audio-level reports (~100 ms at 20 ms frames).
const LEVEL_REPORT_EVERY: u32 = 5;

/// Builds webrtc-rs peer connections sharing one media engine setup.
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // Register only what the mesh sends: Opus voice and VP8 screen share.
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .context("Failed to register Opus codec")?;

        let video_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
        ];
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_string(),
                        rtcp_feedback: video_feedback,
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("Failed to register VP8 codec")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }]
        } else {
            ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect()
        };

        info!(servers = ice_servers.len(), "WebRTC transport factory ready");
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl crate::transport::TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        wire_callbacks(&pc, remote, events);
        debug!(peer = %remote, "Peer connection created");

        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
            ice_restart_pending: AtomicBool::new(false),
        }))
    }
}

fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    remote: &PeerId,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(json) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidatePayload {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let peer = remote.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        match state {
            RTCPeerConnectionState::Failed => warn!(%peer, "Peer connection failed"),
            RTCPeerConnectionState::Disconnected => {
                warn!(%peer, "Peer connection disconnected (ICE may recover)")
            }
            _ => debug!(%peer, ?state, "Peer connection state changed"),
        }
        if let Some(mapped) = map_connection_state(state) {
            let _ = tx.send(TransportEvent::ConnectionState(mapped));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        if let Some(mapped) = map_ice_state(state) {
            let _ = tx.send(TransportEvent::IceState(mapped));
        }
        Box::pin(async {})
    }));

    let peer = remote.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = events.clone();
        let peer = peer.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            info!(%peer, track = %track.id(), kind = kind.as_str(), "Remote track received");
            let _ = tx.send(TransportEvent::Track(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
            if kind == TrackKind::Audio {
                tokio::spawn(meter_remote_audio(track, tx, peer));
            }
        })
    }));
}

/// Decode a remote Opus track and report its level until the track ends.
async fn meter_remote_audio(
    track: Arc<TrackRemote>,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer: PeerId,
) {
    let mut decoder = match OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo) {
        Ok(d) => d,
        Err(e) => {
            warn!(%peer, "Opus decoder unavailable, remote level disabled: {e:?}");
            return;
        }
    };
    // 120 ms of stereo at 48 kHz is the largest Opus frame.
    let mut pcm = vec![0i16; 5760 * 2];
    let mut frames = 0u32;
    let mut energy = 0.0f32;

    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        let decoded = match Packet::try_from(&packet.payload[..]).and_then(|input| {
            decoder.decode(Some(input), MutSignals::try_from(&mut pcm[..])?, false)
        }) {
            Ok(n) => n,
            Err(e) => {
                debug!(%peer, "Opus decode failed: {e:?}");
                continue;
            }
        };
        energy = energy.max(rms_i16(&pcm[..decoded * 2]));
        frames += 1;
        if frames >= LEVEL_REPORT_EVERY {
            if events.send(TransportEvent::AudioLevel(energy)).is_err() {
                break;
            }
            frames = 0;
            energy = 0.0;
        }
    }
    debug!(%peer, "Remote audio meter stopped");
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

struct SenderEntry {
    track: LocalTrack,
    sender: Arc<RTCRtpSender>,
}

/// `MediaTransport` over a webrtc-rs `RTCPeerConnection`.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, SenderEntry>>,
    ice_restart_pending: AtomicBool,
}

impl RtcTransport {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let parsed = match desc.kind {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        parsed.map_err(|e| TransportError::Negotiation(format!("invalid SDP: {e}")))
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let sender = self
            .pc
            .add_track(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(format!("add {}: {e}", track.id())))?;

        // Drain RTCP so the interceptors keep running.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move { while rtcp_sender.read_rtcp().await.is_ok() {} });

        self.senders.lock().await.insert(
            track.id().to_string(),
            SenderEntry {
                track: track.clone(),
                sender,
            },
        );
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool, TransportError> {
        let Some(entry) = self.senders.lock().await.remove(track_id) else {
            return Ok(false);
        };
        self.pc
            .remove_track(&entry.sender)
            .await
            .map_err(|e| TransportError::Track(format!("remove {track_id}: {e}")))?;
        Ok(true)
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let mut senders = self.senders.lock().await;
        let Some(old_id) = senders
            .iter()
            .find(|(_, e)| e.track.kind() == track.kind())
            .map(|(id, _)| id.clone())
        else {
            return Ok(false);
        };
        let Some(entry) = senders.remove(&old_id) else {
            return Ok(false);
        };
        entry
            .sender
            .replace_track(Some(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| TransportError::Track(format!("replace {old_id}: {e}")))?;
        senders.insert(
            track.id().to_string(),
            SenderEntry {
                track: track.clone(),
                sender: entry.sender,
            },
        );
        Ok(true)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let ice_restart = self.ice_restart_pending.swap(false, Ordering::AcqRel);
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create offer: {e}")))?;
        if ice_restart {
            info!("ICE restart offer created");
        }
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set local description: {e}")))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set remote description: {e}")))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.current_remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        self.ice_restart_pending.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_encoding_cap(
        &self,
        track_id: &str,
        cap: EncodingCap,
    ) -> Result<(), TransportError> {
        // webrtc-rs has no per-sender encoding parameters; the cap travels
        // with the shared track to the encoder feeding it.
        let senders = self.senders.lock().await;
        let entry = senders
            .get(track_id)
            .ok_or_else(|| TransportError::Track(format!("no sender for {track_id}")))?;
        entry.track.apply_cap(cap);
        Ok(())
    }

    async fn counters(&self) -> TransportCounters {
        let stats = self.pc.get_stats().await;
        let mut counters = TransportCounters::default();
        for (_key, stat) in stats.reports.iter() {
            match stat {
                StatsReportType::OutboundRTP(rtp) => counters.bytes_sent += rtp.bytes_sent,
                StatsReportType::InboundRTP(rtp) => counters.bytes_received += rtp.bytes_received,
                _ => {}
            }
        }
        counters
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(format!("close: {e}")))?;
        debug!("Peer connection closed");
        Ok(())
    }
}
