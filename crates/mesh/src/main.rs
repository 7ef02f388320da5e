use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use vortex_mesh::audio::{DeviceProvider, ToneProvider};
use vortex_mesh::cli::{self, Command};
use vortex_mesh::{
    AudioControls, AudioPipeline, LocalTrack, MeshCoordinator, MeshHandle, MeshOptions,
    MemoryRelay, PipelineEvent, RecoveryMonitor, RecoverySignal, RtcTransportFactory,
    SessionTargets, SignalingRelay, TransportFactory, TransportSource, Visibility,
    run_stats_poller,
};
use vortex_protocol::{PeerId, VortexConfig};

/// One in-process participant and the tasks it owns.
struct Peer {
    mesh: MeshHandle,
    pipeline: Arc<AudioPipeline>,
    signals: mpsc::UnboundedSender<RecoverySignal>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("VORTEX_LOG_JSON").is_ok_and(|v| v == "1");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn device_provider(index: usize, mic: Option<&str>) -> anyhow::Result<Arc<dyn DeviceProvider>> {
    match (index, mic) {
        (0, Some(source)) => microphone(source),
        // A distinct pitch per peer makes the streams easy to tell apart.
        _ => Ok(ToneProvider::new(220.0 * (index as f32 + 1.0), 0.2) as Arc<dyn DeviceProvider>),
    }
}

#[cfg(feature = "pulse")]
fn microphone(source: &str) -> anyhow::Result<Arc<dyn DeviceProvider>> {
    let source = (source != "default").then(|| source.to_string());
    let provider: Arc<dyn DeviceProvider> =
        Arc::new(vortex_mesh::audio::device::PulseProvider { source });
    Ok(provider)
}

#[cfg(not(feature = "pulse"))]
fn microphone(_source: &str) -> anyhow::Result<Arc<dyn DeviceProvider>> {
    anyhow::bail!("--mic needs a build with the `pulse` feature")
}

async fn start_peer(
    index: usize,
    room: &str,
    sub_room: Option<&str>,
    mic: Option<&str>,
    config: &VortexConfig,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    cancel: &CancellationToken,
) -> anyhow::Result<Peer> {
    let local = PeerId::from(format!("peer-{index:02}"));
    let span = info_span!("peer", id = %local);

    let track = LocalTrack::audio(format!("{local}-mic"), format!("{local}-stream"));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(AudioPipeline::new(
        config.audio.clone(),
        device_provider(index, mic)?,
        AudioControls::new(),
        track.clone(),
        events_tx,
    ));
    // A peer without a working capture device still joins, just silent.
    let audio = match pipeline.start() {
        Ok(()) => Some(track),
        Err(e) => {
            warn!(peer = %local, "Audio unavailable, joining without a local track: {e}");
            None
        }
    };

    let mut options = MeshOptions::new(room, local.clone(), config);
    options.display_name = Some(format!("Peer {}", index + 1));
    if let Some(sub_room) = sub_room {
        options.sub_room = sub_room.to_string();
    }
    let mesh = MeshCoordinator::start(options, relay, factory, audio)
        .await
        .with_context(|| format!("Failed to join room as {local}"))?;

    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let monitor = RecoveryMonitor::new(
        Arc::new(SessionTargets {
            pipeline: Arc::clone(&pipeline),
            mesh: mesh.clone(),
        }),
        Duration::from_millis(config.recovery.settle_delay_ms),
    );
    tokio::spawn(
        monitor
            .run(signals_rx, cancel.child_token())
            .instrument(span.clone()),
    );

    let device_signals = signals_tx.clone();
    tokio::spawn(
        async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PipelineEvent::DeviceEnded { device } => {
                        warn!(%device, "Capture device ended");
                        let _ = device_signals.send(RecoverySignal::DeviceEnded);
                    }
                    PipelineEvent::Speaking(speaking) => debug!(speaking, "Local voice activity"),
                    PipelineEvent::Mode(mode) => info!(?mode, "Audio pipeline mode"),
                    PipelineEvent::Level { .. } => {}
                }
            }
        }
        .instrument(span.clone()),
    );

    let (rates_tx, _rates_rx) = watch::channel(None);
    let source: Arc<dyn TransportSource> = Arc::new(mesh.clone());
    tokio::spawn(
        run_stats_poller(
            source,
            Duration::from_millis(config.stats.poll_interval_ms),
            rates_tx,
            cancel.child_token(),
        )
        .instrument(span.clone()),
    );

    let mut snapshots = mesh.subscribe();
    let watch_cancel = cancel.child_token();
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let connected = snapshot
                    .connections
                    .values()
                    .filter(|state| !state.is_broken())
                    .count();
                info!(
                    sub_room = %snapshot.sub_room,
                    connected,
                    total = snapshot.connections.len(),
                    streams = snapshot.remote_streams.len(),
                    "Mesh updated"
                );
            }
        }
        .instrument(span),
    );

    Ok(Peer {
        mesh,
        pipeline,
        signals: signals_tx,
    })
}

fn broadcast(peers: &[Peer], signal: RecoverySignal) {
    for peer in peers {
        let _ = peer.signals.send(signal.clone());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = match cli::parse_args()? {
        Command::Run(args) => args,
        Command::Help => {
            println!("{}", cli::USAGE);
            return Ok(());
        }
        Command::Version => {
            println!("vortex-mesh {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let config = vortex_mesh::config::from_env()?;
    info!(
        room = %args.room,
        peers = args.peers,
        "Starting vortex-mesh loopback room"
    );

    let relay: Arc<dyn SignalingRelay> = Arc::new(MemoryRelay::new());
    let factory: Arc<dyn TransportFactory> = Arc::new(
        RtcTransportFactory::new(&config.ice.servers())
            .context("Failed to create WebRTC transport factory")?,
    );
    let cancel = CancellationToken::new();

    let mut peers = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        match start_peer(
            index,
            &args.room,
            args.sub_room.as_deref(),
            args.mic.as_deref(),
            &config,
            Arc::clone(&relay),
            Arc::clone(&factory),
            &cancel,
        )
        .await
        {
            Ok(peer) => peers.push(peer),
            Err(e) => {
                warn!("{e:#}");
                break;
            }
        }
    }

    if peers.len() == args.peers {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        // SIGUSR1/SIGUSR2 stand in for the app going to the background and back.
        let mut sighide =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
        let mut sigshow =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())?;
        let deadline = tokio::time::sleep(args.duration.unwrap_or(Duration::MAX));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = &mut deadline, if args.duration.is_some() => {
                    info!("Duration elapsed, shutting down");
                    break;
                }
                _ = sighide.recv() => {
                    for peer in &peers {
                        peer.pipeline.suspend();
                    }
                    broadcast(&peers, RecoverySignal::Visibility(Visibility::Hidden));
                }
                _ = sigshow.recv() => {
                    broadcast(&peers, RecoverySignal::Visibility(Visibility::Visible));
                }
            }
        }
    }

    cancel.cancel();
    for peer in &peers {
        peer.mesh.shutdown().await;
    }
    for peer in peers {
        let pipeline = peer.pipeline;
        tokio::task::spawn_blocking(move || pipeline.shutdown())
            .await
            .context("Audio shutdown task failed")?;
    }
    info!("vortex-mesh stopped");
    Ok(())
}
