use std::collections::BTreeMap;

use vortex_protocol::PeerId;

/// Speaking indicator for the local microphone.
///
/// Hysteresis around the gate threshold plus frame debouncing so the
/// indicator does not flicker when the level hovers near the threshold.
#[derive(Debug, Clone)]
pub struct LocalVoiceActivity {
    threshold: f32,
    active: bool,
    above: u32,
    below: u32,
}

impl LocalVoiceActivity {
    const OPEN_RATIO: f32 = 1.3;
    const CLOSE_RATIO: f32 = 0.65;
    const ACTIVATION_FRAMES: u32 = 3;
    const DEACTIVATION_FRAMES: u32 = 12;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            active: false,
            above: 0,
            below: 0,
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn reset(&mut self) {
        self.active = false;
        self.above = 0;
        self.below = 0;
    }

    /// Feed one frame's level. Returns the indicator state after it.
    pub fn update(&mut self, level: f32, muted: bool) -> bool {
        if muted {
            self.reset();
            return false;
        }
        if !self.active {
            if level > self.threshold * Self::OPEN_RATIO {
                self.above += 1;
                self.below = 0;
                if self.above >= Self::ACTIVATION_FRAMES {
                    self.active = true;
                }
            } else {
                self.above = 0;
            }
        } else if level < self.threshold * Self::CLOSE_RATIO {
            self.below += 1;
            self.above = 0;
            if self.below >= Self::DEACTIVATION_FRAMES {
                self.active = false;
            }
        } else {
            self.below = 0;
        }
        self.active
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VoiceActivity {
    pub is_active: bool,
    pub level: f32,
}

#[derive(Debug, Default)]
struct PeerCounters {
    activity: VoiceActivity,
    above: u32,
    below: u32,
}

/// Per-peer speaking indicators fed from remote audio levels.
#[derive(Debug)]
pub struct RemoteVoiceActivity {
    threshold: f32,
    peers: BTreeMap<PeerId, PeerCounters>,
}

impl RemoteVoiceActivity {
    const ACTIVATION_FRAMES: u32 = 3;
    const DEACTIVATION_FRAMES: u32 = 8;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            peers: BTreeMap::new(),
        }
    }

    /// Feed one level sample for `peer`. Returns whether `is_active` flipped.
    pub fn update(&mut self, peer: &PeerId, level: f32) -> bool {
        let entry = self.peers.entry(peer.clone()).or_default();
        if level > self.threshold {
            entry.above += 1;
            entry.below = 0;
        } else {
            entry.below += 1;
            entry.above = 0;
        }
        let was_active = entry.activity.is_active;
        let is_active = entry.above >= Self::ACTIVATION_FRAMES
            || (was_active && entry.below < Self::DEACTIVATION_FRAMES);
        entry.activity = VoiceActivity { is_active, level };
        was_active != is_active
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn get(&self, peer: &PeerId) -> Option<VoiceActivity> {
        self.peers.get(peer).map(|c| c.activity)
    }

    pub fn snapshot(&self) -> BTreeMap<PeerId, VoiceActivity> {
        self.peers
            .iter()
            .map(|(peer, c)| (peer.clone(), c.activity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_needs_three_loud_frames() {
        let mut vad = LocalVoiceActivity::new(0.01);
        assert!(!vad.update(0.02, false));
        assert!(!vad.update(0.02, false));
        assert!(vad.update(0.02, false));
    }

    #[test]
    fn local_hysteresis_band_holds_state() {
        let mut vad = LocalVoiceActivity::new(0.01);
        // Between close (0.0065) and open (0.013): never activates.
        for _ in 0..20 {
            assert!(!vad.update(0.01, false));
        }
        for _ in 0..3 {
            vad.update(0.05, false);
        }
        // Same level keeps it active.
        for _ in 0..20 {
            assert!(vad.update(0.01, false));
        }
        for _ in 0..11 {
            assert!(vad.update(0.0, false));
        }
        assert!(!vad.update(0.0, false));
    }

    #[test]
    fn local_mute_resets() {
        let mut vad = LocalVoiceActivity::new(0.01);
        for _ in 0..3 {
            vad.update(0.05, false);
        }
        assert!(!vad.update(0.05, true));
        assert!(!vad.update(0.05, false));
    }

    #[test]
    fn remote_activation_and_release() {
        let mut vad = RemoteVoiceActivity::new(0.01);
        let peer = PeerId::from("b");
        assert!(!vad.update(&peer, 0.1));
        assert!(!vad.update(&peer, 0.1));
        assert!(vad.update(&peer, 0.1));
        assert!(vad.get(&peer).unwrap().is_active);

        for _ in 0..7 {
            assert!(!vad.update(&peer, 0.0));
        }
        assert!(vad.update(&peer, 0.0));
        assert_eq!(
            vad.get(&peer),
            Some(VoiceActivity {
                is_active: false,
                level: 0.0
            })
        );

        vad.remove(&peer);
        assert!(vad.snapshot().is_empty());
    }
}
