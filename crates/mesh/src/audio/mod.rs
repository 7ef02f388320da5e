//! Local audio: capture devices, the gate/denoise pipeline that produces the
//! outgoing track, and voice activity detection.

pub mod denoise;
pub mod device;
pub mod gate;
pub mod levels;
pub mod pipeline;
pub mod vad;

pub use device::{CaptureDevice, DeviceError, DeviceProvider, ToneProvider};
pub use pipeline::{AudioControls, AudioPipeline, PipelineEvent, PipelineMode};
pub use vad::{LocalVoiceActivity, RemoteVoiceActivity, VoiceActivity};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("denoiser unavailable: {0}")]
    Denoise(String),
    #[error("noise gate unavailable: {0}")]
    Gate(String),
    #[error("Opus encoder setup failed: {0:#}")]
    Encoder(anyhow::Error),
    #[error("failed to spawn audio thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("audio pipeline shut down")]
    ShutDown,
}
