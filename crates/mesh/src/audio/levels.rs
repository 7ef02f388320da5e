//! Signal level helpers shared by the gate, the detectors and the meters.

/// Quietest level shown on a meter, in dBFS.
pub const METER_FLOOR_DB: f32 = -60.0;

/// Root-mean-square of normalised samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// RMS of 16-bit PCM, normalised to 0..1.
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| {
            let v = f64::from(*s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Map an RMS level onto a 0..100 meter covering -60..0 dBFS.
pub fn rms_to_percent(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db - METER_FLOOR_DB) / -METER_FLOOR_DB * 100.0).clamp(0.0, 100.0)
}

/// Inverse of [`rms_to_percent`], used to turn a threshold slider into an RMS value.
pub fn percent_to_rms(percent: f32) -> f32 {
    let percent = percent.clamp(0.0, 100.0);
    let db = METER_FLOOR_DB + percent / 100.0 * -METER_FLOOR_DB;
    10f32.powf(db / 20.0)
}

/// Zero-crossing rate: fraction of adjacent sample pairs that change sign.
pub fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
        .count();
    crossings as f32 / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert!((rms_i16(&[i16::MAX; 16]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn percent_mapping_covers_meter_range() {
        assert_eq!(rms_to_percent(0.0), 0.0);
        assert!((rms_to_percent(1.0) - 100.0).abs() < 1e-3);
        assert!((rms_to_percent(0.001) - 0.0).abs() < 1e-3);
        assert!((rms_to_percent(0.0316) - 50.0).abs() < 0.1);
        let back = percent_to_rms(rms_to_percent(0.05));
        assert!((back - 0.05).abs() < 1e-4);
    }

    #[test]
    fn zcr_counts_sign_changes() {
        assert_eq!(zero_crossing_rate(&[1.0, 1.0, 1.0, 1.0]), 0.0);
        assert_eq!(zero_crossing_rate(&[1.0, -1.0, 1.0, -1.0]), 0.75);
    }
}
