use std::time::Duration;

use vortex_protocol::AudioConfig;

/// One-pole gain smoother with separate rise and fall time constants.
#[derive(Debug, Clone)]
pub struct GainRamp {
    current: f32,
    target: f32,
    attack_coef: f32,
    release_coef: f32,
}

fn smoothing_coef(time_constant: Duration, sample_rate: u32) -> f32 {
    let samples = time_constant.as_secs_f32() * sample_rate as f32;
    if samples <= 0.0 {
        return 1.0;
    }
    1.0 - (-1.0 / samples).exp()
}

impl GainRamp {
    pub fn new(attack: Duration, release: Duration, sample_rate: u32) -> Self {
        Self {
            current: 0.0,
            target: 0.0,
            attack_coef: smoothing_coef(attack, sample_rate),
            release_coef: smoothing_coef(release, sample_rate),
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target.clamp(0.0, 1.0);
    }

    /// Jump straight to `value` with no ramp.
    pub fn set_immediate(&mut self, value: f32) {
        self.current = value.clamp(0.0, 1.0);
        self.target = self.current;
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn next(&mut self) -> f32 {
        let coef = if self.target > self.current {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.current += (self.target - self.current) * coef;
        self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateParams {
    pub threshold: f32,
    pub open_ratio: f32,
    pub close_ratio: f32,
    pub hold: Duration,
    pub attack: Duration,
    pub release: Duration,
    pub interval: Duration,
}

impl From<&AudioConfig> for GateParams {
    fn from(config: &AudioConfig) -> Self {
        Self {
            threshold: config.gate_threshold,
            open_ratio: config.gate_open_ratio,
            close_ratio: config.gate_close_ratio,
            hold: Duration::from_millis(config.gate_hold_ms),
            attack: Duration::from_secs_f32(config.gate_attack_ms.max(0.0) / 1000.0),
            release: Duration::from_secs_f32(config.gate_release_ms.max(0.0) / 1000.0),
            interval: Duration::from_millis(config.gate_interval_ms),
        }
    }
}

/// Noise gate with hysteresis and a hold window.
///
/// Level is measured over a fixed interval of samples. The gate opens above
/// `threshold * open_ratio` and only closes once the level has stayed below
/// `threshold * close_ratio` past the hold deadline. Gain follows with a
/// fast attack and a slow release; a forced close (mute, push-to-talk
/// released) drops the gain to zero at once.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    params: GateParams,
    interval_samples: u64,
    hold_samples: u64,
    clock: u64,
    acc_energy: f64,
    acc_count: u64,
    open: bool,
    hold_until: u64,
    forced_closed: bool,
    last_level: f32,
    ramp: GainRamp,
}

impl NoiseGate {
    pub fn new(params: GateParams, sample_rate: u32) -> Self {
        let to_samples = |d: Duration| (d.as_secs_f64() * f64::from(sample_rate)).round() as u64;
        Self {
            interval_samples: to_samples(params.interval).max(1),
            hold_samples: to_samples(params.hold),
            clock: 0,
            acc_energy: 0.0,
            acc_count: 0,
            open: false,
            hold_until: 0,
            forced_closed: false,
            last_level: 0.0,
            ramp: GainRamp::new(params.attack, params.release, sample_rate),
            params,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.params.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.params.threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn gain(&self) -> f32 {
        self.ramp.current()
    }

    /// Level measured over the most recent interval.
    pub fn level(&self) -> f32 {
        self.last_level
    }

    /// Hold the gate shut regardless of level.
    pub fn set_forced_closed(&mut self, forced: bool) {
        if forced && !self.forced_closed {
            self.open = false;
            self.ramp.set_immediate(0.0);
        }
        self.forced_closed = forced;
    }

    fn evaluate(&mut self, level: f32) {
        self.last_level = level;
        if self.forced_closed {
            return;
        }
        let open_threshold = self.params.threshold * self.params.open_ratio;
        let close_threshold = self.params.threshold * self.params.close_ratio;
        if !self.open {
            if level > open_threshold {
                self.open = true;
                self.hold_until = self.clock + self.hold_samples;
                self.ramp.set_target(1.0);
            }
        } else if level >= close_threshold {
            self.hold_until = self.clock + self.hold_samples;
        } else if self.clock >= self.hold_until {
            self.open = false;
            self.ramp.set_target(0.0);
        }
    }

    /// Gate `samples` in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            self.acc_energy += f64::from(*sample) * f64::from(*sample);
            self.acc_count += 1;
            self.clock += 1;
            if self.acc_count >= self.interval_samples {
                let level = (self.acc_energy / self.acc_count as f64).sqrt() as f32;
                self.acc_energy = 0.0;
                self.acc_count = 0;
                self.evaluate(level);
            }
            *sample *= if self.forced_closed { 0.0 } else { self.ramp.next() };
        }
    }
}
