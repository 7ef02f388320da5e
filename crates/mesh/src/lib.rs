//! Full-mesh WebRTC session orchestration for Vortex rooms.
//!
//! Every participant in a sub-room holds one peer connection to every other
//! participant. [`MeshCoordinator`] reconciles room membership into that set
//! of connections, using a [`SignalingRelay`] to exchange offers, answers and
//! ICE candidates, and a [`TransportFactory`] to create the media transports.

pub mod audio;
pub mod cli;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod memory_relay;
pub mod mesh;
pub mod recovery;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod screen_share;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testing;

pub use audio::{AudioControls, AudioPipeline, PipelineEvent, PipelineMode};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use memory_relay::MemoryRelay;
pub use mesh::{MeshCoordinator, MeshError, MeshHandle, MeshOptions, MeshSnapshot};
pub use recovery::{RecoveryMonitor, RecoverySignal, SessionTargets, Visibility};
pub use relay::{RelayError, SignalingRelay};
pub use rtc::RtcTransportFactory;
pub use screen_share::{ScreenShareController, ShareBudget};
pub use stats::{BandwidthRates, TransportSource, run_stats_poller};
pub use transport::{LocalTrack, MediaTransport, TransportFactory};
