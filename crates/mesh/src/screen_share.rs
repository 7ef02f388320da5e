use std::sync::Arc;

use tracing::{debug, info, warn};
use vortex_protocol::{PeerId, ScreenShareConfig};

use crate::connection::PeerLink;
use crate::handshake::Handshake;
use crate::transport::{EncodingCap, LocalTrack, TrackKind, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("already sharing")]
    AlreadySharing,
    #[error("{0} is already presenting in this sub-room")]
    PresenterBusy(PeerId),
    #[error("screen share needs a video track, got {0}")]
    NotVideo(&'static str),
    #[error("failed to attach screen share for {peer}: {source}")]
    Attach {
        peer: PeerId,
        #[source]
        source: TransportError,
    },
}

/// Outgoing bandwidth budget for a screen share, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareBudget {
    pub total_bps: u32,
    pub floor_bps: u32,
    pub high_framerate: u32,
    pub low_framerate: u32,
    pub framerate_peer_threshold: usize,
}

impl From<&ScreenShareConfig> for ShareBudget {
    fn from(config: &ScreenShareConfig) -> Self {
        Self {
            total_bps: config.total_bitrate_kbps.saturating_mul(1000),
            floor_bps: config.min_bitrate_kbps.saturating_mul(1000),
            high_framerate: config.high_framerate,
            low_framerate: config.low_framerate,
            framerate_peer_threshold: config.framerate_peer_threshold as usize,
        }
    }
}

/// Split the budget evenly across `viewers`, never below the per-viewer floor.
pub fn compute_cap(budget: &ShareBudget, viewers: usize) -> EncodingCap {
    let n = u32::try_from(viewers.max(1)).unwrap_or(u32::MAX);
    let max_framerate = if viewers <= budget.framerate_peer_threshold {
        budget.high_framerate
    } else {
        budget.low_framerate
    };
    EncodingCap {
        max_bitrate_bps: (budget.total_bps / n).max(budget.floor_bps),
        max_framerate,
    }
}

struct ActiveShare {
    track: LocalTrack,
    viewers: usize,
    cap: EncodingCap,
}

/// Local presenter state: which track is being shared and the cap in force.
pub struct ScreenShareController {
    budget: ShareBudget,
    active: Option<ActiveShare>,
}

impl ScreenShareController {
    pub fn new(budget: ShareBudget) -> Self {
        Self {
            budget,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn track(&self) -> Option<&LocalTrack> {
        self.active.as_ref().map(|a| &a.track)
    }

    pub fn cap(&self) -> Option<EncodingCap> {
        self.active.as_ref().map(|a| a.cap)
    }

    /// Attach `track` to every link and renegotiate. On any attach failure the
    /// track is pulled from the links it already reached and nothing changes.
    pub async fn start(
        &mut self,
        track: LocalTrack,
        remote_presenter: Option<&PeerId>,
        links: &[Arc<PeerLink>],
        handshake: &Handshake,
    ) -> Result<EncodingCap, ShareError> {
        if self.active.is_some() {
            return Err(ShareError::AlreadySharing);
        }
        if let Some(presenter) = remote_presenter {
            return Err(ShareError::PresenterBusy(presenter.clone()));
        }
        if track.kind() != TrackKind::Video {
            return Err(ShareError::NotVideo(track.kind().as_str()));
        }

        let mut attached: Vec<&Arc<PeerLink>> = Vec::with_capacity(links.len());
        for link in links.iter().filter(|l| !l.is_closed()) {
            if let Err(source) = link.transport.add_track(&track).await {
                for done in attached {
                    if let Err(e) = done.transport.remove_track(track.id()).await {
                        debug!(peer = %done.remote, "Rollback of screen track failed: {e}");
                    }
                }
                return Err(ShareError::Attach {
                    peer: link.remote.clone(),
                    source,
                });
            }
            attached.push(link);
        }

        let viewers = attached.len();
        let cap = compute_cap(&self.budget, viewers);
        self.active = Some(ActiveShare {
            track,
            viewers,
            cap,
        });
        self.apply_cap(links).await;
        for link in attached {
            renegotiate(handshake, link).await;
        }
        info!(
            viewers,
            bitrate_bps = cap.max_bitrate_bps,
            framerate = cap.max_framerate,
            "Screen share started"
        );
        Ok(cap)
    }

    /// Pull the share track from every link and renegotiate. Returns the track
    /// that was being shared, already marked ended; `None` if nothing was.
    pub async fn stop(&mut self, links: &[Arc<PeerLink>], handshake: &Handshake) -> Option<LocalTrack> {
        let share = self.active.take()?;
        for link in links.iter().filter(|l| !l.is_closed()) {
            match link.transport.remove_track(share.track.id()).await {
                Ok(true) => renegotiate(handshake, link).await,
                Ok(false) => {}
                Err(e) => warn!(peer = %link.remote, "Failed to remove screen track: {e}"),
            }
        }
        share.track.end();
        info!("Screen share stopped");
        Some(share.track)
    }

    /// Drop the share without renegotiating; used when every link is going away.
    pub fn abandon(&mut self) -> Option<LocalTrack> {
        let share = self.active.take()?;
        share.track.end();
        Some(share.track)
    }

    /// Add the active share to a freshly created link, before its first offer.
    pub async fn attach(&self, link: &PeerLink) -> Result<(), TransportError> {
        let Some(share) = &self.active else {
            return Ok(());
        };
        link.transport.add_track(&share.track).await?;
        link.transport
            .set_encoding_cap(share.track.id(), share.cap)
            .await
    }

    /// Recompute the cap when the number of viewers changes.
    pub async fn viewers_changed(&mut self, links: &[Arc<PeerLink>]) {
        let viewers = links.iter().filter(|l| !l.is_closed()).count();
        let Some(share) = self.active.as_mut() else {
            return;
        };
        if share.viewers == viewers {
            return;
        }
        share.viewers = viewers;
        share.cap = compute_cap(&self.budget, viewers);
        info!(
            viewers,
            bitrate_bps = share.cap.max_bitrate_bps,
            framerate = share.cap.max_framerate,
            "Screen share cap updated"
        );
        self.apply_cap(links).await;
    }

    async fn apply_cap(&self, links: &[Arc<PeerLink>]) {
        let Some(share) = &self.active else {
            return;
        };
        share.track.apply_cap(share.cap);
        for link in links.iter().filter(|l| !l.is_closed()) {
            if let Err(e) = link
                .transport
                .set_encoding_cap(share.track.id(), share.cap)
                .await
            {
                debug!(peer = %link.remote, "Encoding cap not applied: {e}");
            }
        }
    }
}

async fn renegotiate(handshake: &Handshake, link: &Arc<PeerLink>) {
    if let Err(e) = handshake.create_offer(link).await {
        warn!(peer = %link.remote, "Renegotiation after track change failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::memory_relay::MemoryRelay;
    use crate::testing::{FakeFactory, FakeTransport};
    use crate::transport::TransportFactory;

    fn budget() -> ShareBudget {
        ShareBudget::from(&ScreenShareConfig::default())
    }

    #[test]
    fn cap_respects_budget_and_floor() {
        let budget = budget();
        for viewers in [1, 2, 5, 10] {
            let cap = compute_cap(&budget, viewers);
            assert!(cap.max_bitrate_bps >= budget.floor_bps, "viewers={viewers}");
            assert!(
                u64::from(cap.max_bitrate_bps) * viewers as u64 <= u64::from(budget.total_bps),
                "viewers={viewers}"
            );
        }
    }

    #[test]
    fn framerate_drops_above_threshold() {
        let budget = budget();
        let threshold = budget.framerate_peer_threshold;
        assert_eq!(compute_cap(&budget, threshold).max_framerate, budget.high_framerate);
        assert_eq!(compute_cap(&budget, threshold + 1).max_framerate, budget.low_framerate);
    }

    #[test]
    fn floor_wins_when_budget_is_thin() {
        let budget = ShareBudget {
            total_bps: 1_000_000,
            floor_bps: 250_000,
            ..budget()
        };
        assert_eq!(compute_cap(&budget, 8).max_bitrate_bps, 250_000);
        assert_eq!(compute_cap(&budget, 0).max_bitrate_bps, 1_000_000);
    }

    async fn links(factory: &FakeFactory, remotes: &[&str]) -> Vec<Arc<PeerLink>> {
        let mut out = Vec::new();
        for (i, remote) in remotes.iter().enumerate() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let transport = factory.create(&PeerId::from(*remote), tx).await.unwrap();
            out.push(Arc::new(PeerLink::new(
                &PeerId::from("a"),
                PeerId::from(*remote),
                transport,
                i as u64,
            )));
        }
        out
    }

    fn handshake() -> Handshake {
        Handshake::new(Arc::new(MemoryRelay::new()), "room", PeerId::from("a"))
    }

    #[tokio::test]
    async fn start_attaches_caps_and_renegotiates() {
        let factory = FakeFactory::new("a");
        let links = links(&factory, &["b", "c"]).await;
        let mut share = ScreenShareController::new(budget());
        let track = LocalTrack::video("screen", "a");

        let cap = share.start(track.clone(), None, &links, &handshake()).await.unwrap();
        assert_eq!(cap, compute_cap(&budget(), 2));
        assert_eq!(track.current_cap(), Some(cap));
        for remote in ["b", "c"] {
            let fake = factory.latest(remote).unwrap();
            assert_eq!(fake.track_ids(), vec!["screen".to_string()]);
            assert_eq!(fake.caps(), vec![("screen".to_string(), cap)]);
            assert_eq!(fake.offers_created(), 1);
        }
    }

    #[tokio::test]
    async fn start_is_refused_while_someone_presents() {
        let factory = FakeFactory::new("a");
        let links = links(&factory, &["b"]).await;
        let mut share = ScreenShareController::new(budget());
        let presenter = PeerId::from("b");
        let result = share
            .start(LocalTrack::video("screen", "a"), Some(&presenter), &links, &handshake())
            .await;
        assert!(matches!(result, Err(ShareError::PresenterBusy(p)) if p == presenter));
        assert!(!share.is_active());
        assert!(factory.latest("b").unwrap().track_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_attach_rolls_back() {
        let good = FakeFactory::new("a");
        let bad = FakeFactory::rejecting_video("a");
        let mut all = links(&good, &["b"]).await;
        all.extend(links(&bad, &["c"]).await);

        let mut share = ScreenShareController::new(budget());
        let result = share
            .start(LocalTrack::video("screen", "a"), None, &all, &handshake())
            .await;
        assert!(matches!(result, Err(ShareError::Attach { .. })));
        assert!(!share.is_active());
        let b: Arc<FakeTransport> = good.latest("b").unwrap();
        assert!(b.track_ids().is_empty());
        assert_eq!(b.offers_created(), 0);
    }

    #[tokio::test]
    async fn stop_removes_track_and_is_idempotent() {
        let factory = FakeFactory::new("a");
        let links = links(&factory, &["b"]).await;
        let hs = handshake();
        let mut share = ScreenShareController::new(budget());
        let track = LocalTrack::video("screen", "a");
        share.start(track.clone(), None, &links, &hs).await.unwrap();

        assert!(share.stop(&links, &hs).await.is_some());
        assert!(track.is_ended());
        let fake = factory.latest("b").unwrap();
        assert!(fake.track_ids().is_empty());
        assert_eq!(fake.offers_created(), 2);
        assert!(share.stop(&links, &hs).await.is_none());
    }

    #[tokio::test]
    async fn viewer_change_recomputes_cap() {
        let factory = FakeFactory::new("a");
        let mut all = links(&factory, &["b"]).await;
        let mut share = ScreenShareController::new(budget());
        share
            .start(LocalTrack::video("screen", "a"), None, &all, &handshake())
            .await
            .unwrap();
        assert_eq!(share.cap(), Some(compute_cap(&budget(), 1)));

        all.extend(links(&factory, &["c", "d"]).await);
        share.viewers_changed(&all).await;
        assert_eq!(share.cap(), Some(compute_cap(&budget(), 3)));
    }
}
