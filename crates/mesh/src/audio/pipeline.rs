use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vortex_protocol::AudioConfig;

use super::PipelineError;
use super::denoise::SpectralDenoiser;
use super::device::{CaptureDevice, DeviceError, DeviceProvider};
use super::gate::{GateParams, NoiseGate};
use super::levels::{rms, rms_to_percent};
use super::vad::LocalVoiceActivity;
use crate::transport::LocalTrack;

/// Frames between level reports (five per second at 20 ms frames).
const LEVEL_EVERY_FRAMES: u32 = 10;

/// Mute, deafen and push-to-talk state shared between the UI side and the
/// capture thread.
#[derive(Debug, Default)]
pub struct AudioControls {
    muted: AtomicBool,
    deafened: AtomicBool,
    ptt_enabled: AtomicBool,
    ptt_held: AtomicBool,
}

impl AudioControls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Unmuting also clears deafen.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        if !muted {
            self.deafened.store(false, Ordering::Relaxed);
        }
    }

    /// Deafening also mutes.
    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Relaxed);
        if deafened {
            self.muted.store(true, Ordering::Relaxed);
        }
    }

    pub fn set_push_to_talk(&self, enabled: bool) {
        self.ptt_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.ptt_held.store(false, Ordering::Relaxed);
        }
    }

    pub fn set_ptt_held(&self, held: bool) {
        self.ptt_held.store(held, Ordering::Relaxed);
    }

    /// Focus loss or backgrounding while the key is down.
    pub fn release_ptt(&self) {
        self.ptt_held.store(false, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Relaxed)
    }

    pub fn transmit_allowed(&self) -> bool {
        !self.is_muted()
            && (!self.ptt_enabled.load(Ordering::Relaxed) || self.ptt_held.load(Ordering::Relaxed))
    }
}

/// Which stages are active in the current chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Full,
    GateOnly,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Level { rms: f32, percent: f32 },
    Speaking(bool),
    Mode(PipelineMode),
    DeviceEnded { device: String },
}

/// Tunables that can change while the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tuning {
    threshold: f32,
    denoise_enabled: bool,
    intensity: f32,
}

enum Chain {
    Full {
        denoise: SpectralDenoiser,
        gate: NoiseGate,
    },
    GateOnly {
        gate: NoiseGate,
    },
    Passthrough,
}

impl Chain {
    fn mode(&self) -> PipelineMode {
        match self {
            Chain::Full { .. } => PipelineMode::Full,
            Chain::GateOnly { .. } => PipelineMode::GateOnly,
            Chain::Passthrough => PipelineMode::Passthrough,
        }
    }

    fn process(&mut self, frame: &mut [f32], transmit: bool) {
        match self {
            Chain::Full { denoise, gate } => {
                denoise.process(frame);
                gate.set_forced_closed(!transmit);
                gate.process(frame);
            }
            Chain::GateOnly { gate } => {
                gate.set_forced_closed(!transmit);
                gate.process(frame);
            }
            Chain::Passthrough => {
                if !transmit {
                    frame.fill(0.0);
                }
            }
        }
    }
}

fn build_gate(params: GateParams, sample_rate: u32) -> Result<NoiseGate, PipelineError> {
    if sample_rate == 0 {
        return Err(PipelineError::Gate("sample rate must be non-zero".into()));
    }
    if !params.threshold.is_finite() || !params.open_ratio.is_finite() || !params.close_ratio.is_finite() {
        return Err(PipelineError::Gate("non-finite threshold".into()));
    }
    Ok(NoiseGate::new(params, sample_rate))
}

/// Build the richest chain that constructs. A denoiser that fails leaves the
/// gate alone; a gate that fails leaves the raw signal. Never silence.
fn build_chain(config: &AudioConfig, tuning: Tuning) -> Chain {
    let mut params = GateParams::from(config);
    params.threshold = tuning.threshold;
    let gate = match build_gate(params, config.sample_rate) {
        Ok(gate) => gate,
        Err(e) => {
            warn!("{e}, sending raw microphone audio");
            return Chain::Passthrough;
        }
    };
    if !tuning.denoise_enabled {
        return Chain::GateOnly { gate };
    }
    match SpectralDenoiser::new(tuning.intensity, config.sample_rate) {
        Ok(denoise) => Chain::Full { denoise, gate },
        Err(e) => {
            warn!("{e}, continuing with the noise gate only");
            Chain::GateOnly { gate }
        }
    }
}

struct FrameEncoder {
    encoder: OpusEncoder,
    pcm: Vec<i16>,
    out: Vec<u8>,
}

impl FrameEncoder {
    fn new(config: &AudioConfig, frame_samples: usize) -> anyhow::Result<Self> {
        let sample_rate = match config.sample_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            12000 => SampleRate::Hz12000,
            8000 => SampleRate::Hz8000,
            other => anyhow::bail!("Unsupported sample rate for Opus: {other}"),
        };
        let mut encoder = OpusEncoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;
        let bitrate = i32::try_from(config.opus_bitrate_kbps.saturating_mul(1000))
            .map_err(|_| anyhow::anyhow!("Opus bitrate out of range"))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| anyhow::anyhow!("Failed to set Opus bitrate: {e:?}"))?;
        Ok(Self {
            encoder,
            pcm: vec![0i16; frame_samples],
            out: vec![0u8; 4000],
        })
    }

    fn encode(&mut self, frame: &[f32]) -> anyhow::Result<Vec<u8>> {
        for (dst, src) in self.pcm.iter_mut().zip(frame) {
            *dst = (src.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        }
        let len = self
            .encoder
            .encode(&self.pcm, &mut self.out)
            .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
        Ok(self.out[..len].to_vec())
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    device_ended: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

struct Shared {
    tuning: Mutex<Tuning>,
    tuning_rev: AtomicU64,
    suspended: AtomicBool,
    controls: Arc<AudioControls>,
}

impl Shared {
    fn tuning(&self) -> MutexGuard<'_, Tuning> {
        match self.tuning.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Microphone → denoise → gate → Opus → shared outgoing track.
///
/// Capture and DSP run on a dedicated thread; encoded frames cross to an
/// async task that writes them to the [`LocalTrack`] every connection
/// carries. Rebuilding (device change, reacquire after the device ended)
/// stops and joins the old thread before a new one starts.
pub struct AudioPipeline {
    config: AudioConfig,
    provider: Arc<dyn DeviceProvider>,
    track: LocalTrack,
    events: mpsc::UnboundedSender<PipelineEvent>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    shut_down: AtomicBool,
}

impl AudioPipeline {
    pub fn new(
        config: AudioConfig,
        provider: Arc<dyn DeviceProvider>,
        controls: Arc<AudioControls>,
        track: LocalTrack,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        let tuning = Tuning {
            threshold: config.gate_threshold,
            denoise_enabled: config.denoise_enabled,
            intensity: config.denoise_intensity,
        };
        Self {
            config,
            provider,
            track,
            events,
            shared: Arc::new(Shared {
                tuning: Mutex::new(tuning),
                tuning_rev: AtomicU64::new(0),
                suspended: AtomicBool::new(false),
                controls,
            }),
            running: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> &LocalTrack {
        &self.track
    }

    pub fn controls(&self) -> &Arc<AudioControls> {
        &self.shared.controls
    }

    fn frame_samples(&self) -> usize {
        (self.config.sample_rate as usize * self.config.frame_ms as usize) / 1000
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    /// Open the device and start processing. Replaces a running pipeline.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PipelineError::ShutDown);
        }
        self.stop_running();

        let frame_samples = self.frame_samples();
        let device = self
            .provider
            .open(self.config.sample_rate, self.config.channels, frame_samples)?;
        let encoder = FrameEncoder::new(&self.config, frame_samples).map_err(PipelineError::Encoder)?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
        let track = self.track.clone();
        let frame_duration = Duration::from_millis(u64::from(self.config.frame_ms));
        let writer = tokio::spawn(async move {
            while let Some(data) = audio_rx.recv().await {
                if let Err(e) = track.write_sample(&data, frame_duration).await {
                    debug!("Write audio sample: {e:#}");
                }
            }
            debug!("Audio frame channel closed");
        });

        let stop = Arc::new(AtomicBool::new(false));
        let device_ended = Arc::new(AtomicBool::new(false));
        let worker = CaptureWorker {
            config: self.config.clone(),
            device,
            encoder,
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            audio_tx,
            stop: Arc::clone(&stop),
            device_ended: Arc::clone(&device_ended),
            frame_samples,
        };
        let thread = match std::thread::Builder::new()
            .name("audio-pipeline".into())
            .spawn(move || worker.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                writer.abort();
                return Err(e.into());
            }
        };

        *self.running() = Some(Running {
            stop,
            device_ended,
            thread,
            writer,
        });
        Ok(())
    }

    /// Rebuild end to end with a freshly opened device.
    pub fn reacquire(&self) -> Result<(), PipelineError> {
        info!("Reacquiring capture device");
        self.start()
    }

    /// True once the device feeding the running pipeline has gone away.
    pub fn device_ended(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| r.device_ended.load(Ordering::Acquire))
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.shared.tuning().threshold = threshold;
        self.shared.tuning_rev.fetch_add(1, Ordering::Release);
    }

    pub fn set_denoise(&self, enabled: bool, intensity: f32) {
        {
            let mut tuning = self.shared.tuning();
            tuning.denoise_enabled = enabled;
            tuning.intensity = intensity;
        }
        self.shared.tuning_rev.fetch_add(1, Ordering::Release);
    }

    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Returns whether processing was suspended.
    pub fn resume(&self) -> bool {
        self.shared.suspended.swap(false, Ordering::AcqRel)
    }

    fn stop_running(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.stop.store(true, Ordering::Release);
        if let Err(e) = running.thread.join() {
            warn!("Audio thread panicked: {e:?}");
        }
        // The worker dropped its sender; the writer drains and exits.
        drop(running.writer);
    }

    /// Stop capture and release the device. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_running();
        info!("Audio pipeline shut down");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CaptureWorker {
    config: AudioConfig,
    device: Box<dyn CaptureDevice>,
    encoder: FrameEncoder,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    device_ended: Arc<AtomicBool>,
    frame_samples: usize,
}

impl CaptureWorker {
    fn run(mut self) {
        info!(device = self.device.name(), "Audio pipeline thread started");
        let mut frame = vec![0.0f32; self.frame_samples];
        let mut rev = self.shared.tuning_rev.load(Ordering::Acquire);
        let mut tuning = *self.shared.tuning();
        let mut chain = build_chain(&self.config, tuning);
        let _ = self.events.send(PipelineEvent::Mode(chain.mode()));
        let mut vad = LocalVoiceActivity::new(tuning.threshold);
        let mut frames = 0u32;

        while !self.stop.load(Ordering::Acquire) {
            match self.device.read_frame(&mut frame) {
                Ok(()) => {}
                Err(DeviceError::Ended) => {
                    warn!(device = self.device.name(), "Capture device ended");
                    self.device_ended.store(true, Ordering::Release);
                    let _ = self.events.send(PipelineEvent::DeviceEnded {
                        device: self.device.name().to_string(),
                    });
                    return;
                }
                Err(e) => {
                    error!("Audio capture error: {e}");
                    self.device_ended.store(true, Ordering::Release);
                    let _ = self.events.send(PipelineEvent::DeviceEnded {
                        device: self.device.name().to_string(),
                    });
                    return;
                }
            }
            if self.shared.suspended.load(Ordering::Acquire) {
                continue;
            }

            let current = self.shared.tuning_rev.load(Ordering::Acquire);
            if current != rev {
                rev = current;
                let next = *self.shared.tuning();
                if next.denoise_enabled != tuning.denoise_enabled || next.intensity != tuning.intensity {
                    chain = build_chain(&self.config, next);
                    let _ = self.events.send(PipelineEvent::Mode(chain.mode()));
                } else {
                    match &mut chain {
                        Chain::Full { gate, .. } | Chain::GateOnly { gate } => {
                            gate.set_threshold(next.threshold)
                        }
                        Chain::Passthrough => {}
                    }
                }
                vad.set_threshold(next.threshold);
                tuning = next;
            }

            let transmit = self.shared.controls.transmit_allowed();
            let level = rms(&frame);
            chain.process(&mut frame, transmit);

            let was_speaking = vad.is_active();
            if vad.update(level, !transmit) != was_speaking {
                let _ = self.events.send(PipelineEvent::Speaking(vad.is_active()));
            }
            frames += 1;
            if frames >= LEVEL_EVERY_FRAMES {
                frames = 0;
                let _ = self.events.send(PipelineEvent::Level {
                    rms: level,
                    percent: rms_to_percent(level),
                });
            }

            let encoded = match self.encoder.encode(&frame) {
                Ok(data) => data,
                Err(e) => {
                    debug!("{e:#}");
                    continue;
                }
            };
            if self.audio_tx.blocking_send(encoded).is_err() {
                info!("Audio channel closed, stopping audio pipeline");
                return;
            }
        }
        info!("Audio pipeline thread shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::ToneProvider;

    fn config() -> AudioConfig {
        AudioConfig::default()
    }

    fn tuning(config: &AudioConfig) -> Tuning {
        Tuning {
            threshold: config.gate_threshold,
            denoise_enabled: config.denoise_enabled,
            intensity: config.denoise_intensity,
        }
    }

    #[test]
    fn chain_falls_back_stage_by_stage() {
        let cfg = config();
        assert_eq!(build_chain(&cfg, tuning(&cfg)).mode(), PipelineMode::Full);

        let bad_denoise = Tuning {
            intensity: 3.0,
            ..tuning(&cfg)
        };
        assert_eq!(build_chain(&cfg, bad_denoise).mode(), PipelineMode::GateOnly);

        let no_denoise = Tuning {
            denoise_enabled: false,
            ..tuning(&cfg)
        };
        assert_eq!(build_chain(&cfg, no_denoise).mode(), PipelineMode::GateOnly);

        let bad_gate = Tuning {
            threshold: f32::NAN,
            ..tuning(&cfg)
        };
        assert_eq!(build_chain(&cfg, bad_gate).mode(), PipelineMode::Passthrough);
    }

    #[test]
    fn passthrough_still_honours_mute() {
        let mut chain = Chain::Passthrough;
        let mut frame = vec![0.5; 16];
        chain.process(&mut frame, true);
        assert!(frame.iter().all(|s| *s == 0.5));
        chain.process(&mut frame, false);
        assert!(frame.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn controls_link_mute_deafen_and_ptt() {
        let controls = AudioControls::new();
        assert!(controls.transmit_allowed());
        controls.set_deafened(true);
        assert!(controls.is_muted());
        controls.set_muted(false);
        assert!(!controls.is_deafened());

        controls.set_push_to_talk(true);
        assert!(!controls.transmit_allowed());
        controls.set_ptt_held(true);
        assert!(controls.transmit_allowed());
        controls.release_ptt();
        assert!(!controls.transmit_allowed());
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<PipelineEvent>,
        pred: impl Fn(&PipelineEvent) -> bool,
    ) -> PipelineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn device_end_is_reported_and_reacquired() {
        let provider = ToneProvider::flaky(440.0, 0.2, 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = AudioPipeline::new(
            config(),
            provider.clone(),
            AudioControls::new(),
            LocalTrack::audio("mic", "test"),
            tx,
        );
        pipeline.start().unwrap();

        let mode = next_matching(&mut rx, |e| matches!(e, PipelineEvent::Mode(_))).await;
        assert_eq!(mode, PipelineEvent::Mode(PipelineMode::Full));
        next_matching(&mut rx, |e| matches!(e, PipelineEvent::Level { .. })).await;
        next_matching(&mut rx, |e| matches!(e, PipelineEvent::DeviceEnded { .. })).await;
        assert!(pipeline.device_ended());

        pipeline.reacquire().unwrap();
        assert!(!pipeline.device_ended());
        assert_eq!(provider.opened(), 2);
        next_matching(&mut rx, |e| matches!(e, PipelineEvent::Speaking(true))).await;

        pipeline.shutdown();
        pipeline.shutdown();
        assert!(!pipeline.is_running());
        assert!(matches!(pipeline.start(), Err(PipelineError::ShutDown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspend_and_resume() {
        let provider = ToneProvider::flaky(440.0, 0.2, u64::MAX);
        let (tx, _rx) = mpsc::unbounded_channel();
        let pipeline = AudioPipeline::new(
            config(),
            provider,
            AudioControls::new(),
            LocalTrack::audio("mic", "test"),
            tx,
        );
        pipeline.start().unwrap();
        assert!(!pipeline.resume());
        pipeline.suspend();
        assert!(pipeline.is_suspended());
        assert!(pipeline.resume());
        assert!(pipeline.is_running());
        pipeline.shutdown();
    }
}
