use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vortex_protocol::PeerId;

use crate::audio::pipeline::AudioPipeline;
use crate::mesh::MeshHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Inputs to the monitor: app visibility flips and capture devices going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySignal {
    Visibility(Visibility),
    DeviceEnded,
}

/// The pieces of a session the monitor can repair.
#[async_trait]
pub trait RecoveryTargets: Send + Sync {
    /// Resume suspended audio processing. Returns whether it was suspended.
    fn resume_audio(&self) -> bool;

    fn audio_ended(&self) -> bool;

    async fn reacquire_audio(&self) -> anyhow::Result<()>;

    fn release_push_to_talk(&self);

    /// Peers whose connection is failed, disconnected or closed.
    fn broken_connections(&self) -> Vec<PeerId>;

    async fn reevaluate(&self);
}

/// What one recovery pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed_audio: bool,
    pub reacquired_audio: bool,
    pub broken: Vec<PeerId>,
}

/// Repairs state left behind by OS-level suspension.
///
/// Returning to the foreground waits `settle_delay`, then resumes audio,
/// reacquires an ended capture device and asks the mesh to rebuild broken
/// connections. A device that ends while visible is reacquired right away.
pub struct RecoveryMonitor {
    targets: Arc<dyn RecoveryTargets>,
    settle_delay: Duration,
}

impl RecoveryMonitor {
    pub fn new(targets: Arc<dyn RecoveryTargets>, settle_delay: Duration) -> Self {
        Self {
            targets,
            settle_delay,
        }
    }

    pub async fn check(&self) -> RecoveryReport {
        let mut report = RecoveryReport {
            resumed_audio: self.targets.resume_audio(),
            ..Default::default()
        };
        if report.resumed_audio {
            info!("Resumed suspended audio processing");
        }
        if self.targets.audio_ended() {
            report.reacquired_audio = self.reacquire().await;
        }
        report.broken = self.targets.broken_connections();
        if !report.broken.is_empty() {
            warn!(count = report.broken.len(), "Broken connections after resume");
            self.targets.reevaluate().await;
        }
        report
    }

    async fn reacquire(&self) -> bool {
        match self.targets.reacquire_audio().await {
            Ok(()) => {
                info!("Capture device reacquired");
                true
            }
            Err(e) => {
                warn!("Capture device reacquisition failed: {e:#}");
                false
            }
        }
    }

    pub async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<RecoverySignal>,
        cancel: CancellationToken,
    ) {
        let mut hidden = false;
        let mut settle_at: Option<Instant> = None;
        loop {
            let deadline = settle_at;
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    settle_at = None;
                    let report = self.check().await;
                    debug!(?report, "Recovery pass finished");
                    continue;
                }
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            match signal {
                RecoverySignal::Visibility(Visibility::Hidden) => {
                    hidden = true;
                    settle_at = None;
                    self.targets.release_push_to_talk();
                    debug!("App hidden");
                }
                RecoverySignal::Visibility(Visibility::Visible) => {
                    if hidden {
                        hidden = false;
                        settle_at = Some(Instant::now() + self.settle_delay);
                        debug!("App visible again, settling");
                    }
                }
                // While hidden the next foreground pass picks it up.
                RecoverySignal::DeviceEnded if !hidden && settle_at.is_none() => {
                    warn!("Capture device ended, reacquiring");
                    self.reacquire().await;
                }
                RecoverySignal::DeviceEnded => {}
            }
        }
        debug!("Recovery monitor stopped");
    }
}

/// Production targets: the session's audio pipeline and mesh.
pub struct SessionTargets {
    pub pipeline: Arc<AudioPipeline>,
    pub mesh: MeshHandle,
}

#[async_trait]
impl RecoveryTargets for SessionTargets {
    fn resume_audio(&self) -> bool {
        self.pipeline.resume()
    }

    fn audio_ended(&self) -> bool {
        self.pipeline.device_ended()
    }

    async fn reacquire_audio(&self) -> anyhow::Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        // Rebuilding joins the old capture thread.
        tokio::task::spawn_blocking(move || pipeline.reacquire()).await??;
        Ok(())
    }

    fn release_push_to_talk(&self) {
        self.pipeline.controls().release_ptt();
    }

    fn broken_connections(&self) -> Vec<PeerId> {
        self.mesh
            .snapshot()
            .connections
            .into_iter()
            .filter(|(_, state)| state.is_broken())
            .map(|(peer, _)| peer)
            .collect()
    }

    async fn reevaluate(&self) {
        if let Err(e) = self.mesh.reevaluate() {
            debug!("Mesh re-evaluation skipped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        suspended: AtomicBool,
        ended: AtomicBool,
        reacquired: AtomicUsize,
        ptt_released: AtomicUsize,
        reevaluated: AtomicUsize,
        broken: Mutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl RecoveryTargets for Recorder {
        fn resume_audio(&self) -> bool {
            self.suspended.swap(false, Ordering::SeqCst)
        }

        fn audio_ended(&self) -> bool {
            self.ended.load(Ordering::SeqCst)
        }

        async fn reacquire_audio(&self) -> anyhow::Result<()> {
            self.ended.store(false, Ordering::SeqCst);
            self.reacquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release_push_to_talk(&self) {
            self.ptt_released.fetch_add(1, Ordering::SeqCst);
        }

        fn broken_connections(&self) -> Vec<PeerId> {
            self.broken.lock().unwrap().clone()
        }

        async fn reevaluate(&self) {
            self.reevaluated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn check_repairs_everything_it_finds() {
        let targets = Arc::new(Recorder::default());
        targets.suspended.store(true, Ordering::SeqCst);
        targets.ended.store(true, Ordering::SeqCst);
        targets.broken.lock().unwrap().push(PeerId::from("b"));
        let monitor = RecoveryMonitor::new(targets.clone(), Duration::from_millis(500));

        let report = monitor.check().await;
        assert_eq!(
            report,
            RecoveryReport {
                resumed_audio: true,
                reacquired_audio: true,
                broken: vec![PeerId::from("b")],
            }
        );
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 1);

        // Nothing left to do on a second pass.
        assert_eq!(monitor.check().await, RecoveryReport::default());
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 1);
    }

    fn spawn(
        targets: &Arc<Recorder>,
    ) -> (
        mpsc::UnboundedSender<RecoverySignal>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let monitor = RecoveryMonitor::new(targets.clone(), Duration::from_millis(500));
        let task = tokio::spawn(monitor.run(rx, cancel.clone()));
        (tx, cancel, task)
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_checks_wait_for_settle_delay() {
        let targets = Arc::new(Recorder::default());
        let (tx, cancel, task) = spawn(&targets);

        tx.send(RecoverySignal::Visibility(Visibility::Hidden)).unwrap();
        targets.suspended.store(true, Ordering::SeqCst);
        targets.broken.lock().unwrap().push(PeerId::from("c"));
        tx.send(RecoverySignal::Visibility(Visibility::Visible)).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(targets.suspended.load(Ordering::SeqCst));
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!targets.suspended.load(Ordering::SeqCst));
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 1);
        assert_eq!(targets.ptt_released.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hiding_again_cancels_pending_pass() {
        let targets = Arc::new(Recorder::default());
        let (tx, cancel, task) = spawn(&targets);
        targets.broken.lock().unwrap().push(PeerId::from("c"));

        tx.send(RecoverySignal::Visibility(Visibility::Hidden)).unwrap();
        tx.send(RecoverySignal::Visibility(Visibility::Visible)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RecoverySignal::Visibility(Visibility::Hidden)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 0);

        // Visible without a preceding hide is not a return to foreground.
        tx.send(RecoverySignal::Visibility(Visibility::Visible)).unwrap();
        tx.send(RecoverySignal::Visibility(Visibility::Visible)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(targets.reevaluated.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn device_end_while_visible_reacquires_immediately() {
        let targets = Arc::new(Recorder::default());
        let (tx, cancel, task) = spawn(&targets);

        targets.ended.store(true, Ordering::SeqCst);
        tx.send(RecoverySignal::DeviceEnded).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(targets.reacquired.load(Ordering::SeqCst), 1);

        // Hidden: deferred to the foreground pass.
        tx.send(RecoverySignal::Visibility(Visibility::Hidden)).unwrap();
        targets.ended.store(true, Ordering::SeqCst);
        tx.send(RecoverySignal::DeviceEnded).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(targets.reacquired.load(Ordering::SeqCst), 1);
        tx.send(RecoverySignal::Visibility(Visibility::Visible)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(targets.reacquired.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn session_targets_follow_the_capture_device_not_the_track() {
        use vortex_protocol::VortexConfig;

        use crate::audio::{AudioControls, ToneProvider};
        use crate::memory_relay::MemoryRelay;
        use crate::mesh::{MeshCoordinator, MeshOptions};
        use crate::testing::FakeFactory;
        use crate::transport::LocalTrack;

        let config = VortexConfig::default();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(AudioPipeline::new(
            config.audio.clone(),
            ToneProvider::new(440.0, 0.2),
            AudioControls::new(),
            LocalTrack::audio("mic", "a"),
            events,
        ));
        let mesh = MeshCoordinator::start(
            MeshOptions::new("room-1", PeerId::from("a"), &config),
            Arc::new(MemoryRelay::new()),
            FakeFactory::new("a"),
            None,
        )
        .await
        .unwrap();
        let targets = SessionTargets {
            pipeline: Arc::clone(&pipeline),
            mesh: mesh.clone(),
        };

        // The outgoing track outlives device swaps; ending it says nothing
        // about whether capture needs reacquiring.
        pipeline.track().end();
        assert!(!targets.audio_ended());
        assert!(targets.broken_connections().is_empty());
        mesh.shutdown().await;
    }
}
