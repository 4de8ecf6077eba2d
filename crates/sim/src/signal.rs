//! Baseline signal synthesis.
//!
//! A sample is a point drawn around the midpoint of the sensor's normal range
//! plus bounded jitter. The fault engine supplies an optional offset; without
//! one the value is kept inside the jitter-widened normal envelope.

use plantwire_core::{Sensor, Thresholds};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Maximum absolute jitter for a sensor: `jitter_pct × normal span`.
pub fn jitter_bound(thresholds: &Thresholds, jitter_pct: f64) -> f64 {
    thresholds.normal_span() * jitter_pct
}

/// `[normal_min − jitter, normal_max + jitter]` for a sensor.
pub fn normal_envelope(sensor: &Sensor) -> (f64, f64) {
    let jb = jitter_bound(&sensor.thresholds, sensor.kind.profile().jitter_pct);
    (sensor.thresholds.normal_min - jb, sensor.thresholds.normal_max + jb)
}

/// Baseline point inside the normal range.
pub fn baseline<R: Rng + ?Sized>(thresholds: &Thresholds, rng: &mut R) -> f64 {
    let mid = thresholds.normal_mid();
    let half_span = thresholds.normal_span() / 2.0;
    let drawn = Normal::new(mid, half_span / 3.0)
        .map(|d| d.sample(rng))
        .unwrap_or(mid);
    drawn.clamp(thresholds.normal_min, thresholds.normal_max)
}

/// Zero-mean jitter bounded to `±bound`.
pub fn jitter<R: Rng + ?Sized>(bound: f64, rng: &mut R) -> f64 {
    if bound <= 0.0 {
        return 0.0;
    }
    let drawn = Normal::new(0.0, bound / 2.0)
        .map(|d| d.sample(rng))
        .unwrap_or(0.0);
    drawn.clamp(-bound, bound)
}

/// Produce one value for `sensor`.
///
/// `fault_offset` is added unclamped; `None` means no fault is acting on this
/// sensor and the result stays within [`normal_envelope`].
pub fn sample<R: Rng + ?Sized>(sensor: &Sensor, fault_offset: Option<f64>, rng: &mut R) -> f64 {
    let thresholds = &sensor.thresholds;
    let jb = jitter_bound(thresholds, sensor.kind.profile().jitter_pct);
    let value = baseline(thresholds, rng) + jitter(jb, rng);

    match fault_offset {
        Some(offset) => value + offset,
        None => value.clamp(thresholds.normal_min - jb, thresholds.normal_max + jb),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use plantwire_core::{FactoryId, LineId, MachineId, SensorId, SensorKind};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    pub(crate) fn sensor(kind: SensorKind) -> Sensor {
        let profile = kind.profile();
        Sensor {
            id: SensorId::new(format!("M-1-{}", kind.code())),
            machine_id: MachineId::new("M-1"),
            line_id: LineId::new("F01-L1"),
            factory_id: FactoryId::new("F01"),
            kind,
            unit: profile.unit.to_string(),
            thresholds: profile.thresholds,
            sampling_interval_secs: profile.sampling_secs,
        }
    }

    #[test]
    fn same_seed_same_values() {
        let s = sensor(SensorKind::Pressure);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(sample(&s, None, &mut a), sample(&s, None, &mut b));
        }
    }

    #[test]
    fn offset_is_not_clamped() {
        let s = sensor(SensorKind::Vibration);
        let mut rng = StdRng::seed_from_u64(1);
        let v = sample(&s, Some(100.0), &mut rng);
        assert!(v > 100.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn no_fault_stays_in_envelope(seed in any::<u64>(), kind_idx in 0usize..SensorKind::ALL.len()) {
            let s = sensor(SensorKind::ALL[kind_idx]);
            let (lo, hi) = normal_envelope(&s);
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..64 {
                let v = sample(&s, None, &mut rng);
                prop_assert!(v >= lo && v <= hi, "{v} outside [{lo}, {hi}]");
            }
        }
    }
}
