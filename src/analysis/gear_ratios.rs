use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, info};

use crate::errors::ShiftlabError;
use crate::storage::{GearRatioProfile, RunStore};
use crate::telemetry::Sample;

use super::median;

const FULL_THROTTLE: f64 = 0.9;
const MIN_ENGINE_RPM: f64 = 3000.0;
const MIN_SPEED_KMH: f64 = 10.0;
/// Gears with fewer qualifying samples are too noisy to trust
pub const MIN_SAMPLES_PER_GEAR: usize = 20;

/// Full-throttle, in-gear sample usable for ratio detection
pub fn is_ratio_sample(sample: &Sample) -> bool {
    sample.throttle > FULL_THROTTLE
        && sample.engine_rpm > MIN_ENGINE_RPM
        && sample.speed_kmh > MIN_SPEED_KMH
        && sample.torque_proxy > 0.
        && sample.gear >= 1
}

/// Median speed/engine-speed ratio per gear.
///
/// `None` when no sample qualifies at all; otherwise the gears with at
/// least [`MIN_SAMPLES_PER_GEAR`] samples, possibly none.
pub fn compute_gear_ratios<'a>(
    samples: impl IntoIterator<Item = &'a Sample>,
) -> Option<BTreeMap<i32, f64>> {
    let by_gear = samples
        .into_iter()
        .filter(|s| is_ratio_sample(s))
        .map(|s| (s.gear, s.speed_kmh / s.engine_rpm))
        .into_group_map();
    if by_gear.is_empty() {
        return None;
    }

    Some(
        by_gear
            .into_iter()
            .filter_map(|(gear, ratios)| {
                if ratios.len() < MIN_SAMPLES_PER_GEAR {
                    debug!(
                        "Discarding gear {} with only {} samples",
                        gear,
                        ratios.len()
                    );
                    return None;
                }
                median(&ratios).map(|ratio| (gear, ratio))
            })
            .collect(),
    )
}

/// Detect the gear ratios of a vehicle from all of its runs and store them,
/// replacing any earlier profile.
///
/// Returns `None` when no gear has enough data. If no sample qualifies at
/// all the stored profile is left untouched.
pub fn detect_gear_ratios<R: RunStore + ?Sized>(
    store: &mut R,
    vehicle_name: &str,
) -> Result<Option<GearRatioProfile>, ShiftlabError> {
    let runs = store.runs_for_vehicle(vehicle_name)?;
    let Some(ratios) = compute_gear_ratios(runs.iter().flat_map(|run| &run.samples)) else {
        info!("No full-throttle samples for {}", vehicle_name);
        return Ok(None);
    };

    let profile = GearRatioProfile {
        vehicle_name: vehicle_name.to_string(),
        ratios,
    };
    store.save_gear_ratios(&profile)?;
    info!(
        "Detected {} gear ratios for {}",
        profile.ratios.len(),
        vehicle_name
    );
    if profile.ratios.is_empty() {
        return Ok(None);
    }
    Ok(Some(profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRunStore;
    use crate::telemetry::{RunKind, SessionInfo};

    fn pull(gear: i32, speed_kmh: f64, engine_rpm: f64) -> Sample {
        Sample {
            gear,
            speed_kmh,
            engine_rpm,
            throttle: 1.,
            torque_proxy: 4000.,
            ..Default::default()
        }
    }

    fn gear_samples(gear: i32, count: usize, ratio: f64) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let rpm = 4000. + i as f64 * 100.;
                pull(gear, rpm * ratio, rpm)
            })
            .collect()
    }

    fn session() -> SessionInfo {
        SessionInfo {
            vehicle_name: "BMW M4 GT3".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_gear_with_19_samples_is_excluded() {
        let mut samples = gear_samples(1, 19, 0.012);
        samples.extend(gear_samples(2, 21, 0.018));
        samples.extend(gear_samples(3, 20, 0.024));

        let ratios = compute_gear_ratios(&samples).unwrap();
        assert!(!ratios.contains_key(&1));
        assert!(ratios.contains_key(&2));
        assert!(ratios.contains_key(&3));
    }

    #[test]
    fn test_ratio_is_median() {
        let mut samples = gear_samples(2, 20, 0.018);
        samples.push(pull(2, 500., 5000.));
        let expected = {
            let values: Vec<f64> = samples.iter().map(|s| s.speed_kmh / s.engine_rpm).collect();
            median(&values).unwrap()
        };

        let ratios = compute_gear_ratios(&samples).unwrap();
        assert_eq!(ratios[&2], expected);
        assert!((ratios[&2] - 0.018).abs() < 1e-12);
    }

    #[test]
    fn test_non_qualifying_samples_ignored() {
        let samples = vec![
            Sample {
                throttle: 0.5,
                ..pull(2, 100., 5000.)
            },
            pull(2, 100., 2500.),
            pull(2, 5., 5000.),
            Sample {
                torque_proxy: -10.,
                ..pull(2, 100., 5000.)
            },
            pull(0, 100., 5000.),
        ];
        assert!(compute_gear_ratios(&samples).is_none());
    }

    #[test]
    fn test_detection_replaces_stored_profile() {
        let mut store = MemoryRunStore::new();
        store
            .save_gear_ratios(&GearRatioProfile {
                vehicle_name: session().vehicle_name,
                ratios: BTreeMap::from([(1, 0.5), (2, 0.6), (6, 0.9)]),
            })
            .unwrap();
        let mut samples = gear_samples(2, 25, 0.018);
        samples.extend(gear_samples(3, 25, 0.024));
        store.insert_run(&session(), RunKind::Drag, samples);

        let profile = detect_gear_ratios(&mut store, &session().vehicle_name)
            .unwrap()
            .unwrap();
        assert_eq!(profile.ratios.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(
            store.load_gear_ratios(&session().vehicle_name).unwrap(),
            Some(profile)
        );
    }

    #[test]
    fn test_no_data_leaves_profile_untouched() {
        let mut store = MemoryRunStore::new();
        let stored = GearRatioProfile {
            vehicle_name: session().vehicle_name,
            ratios: BTreeMap::from([(1, 0.5)]),
        };
        store.save_gear_ratios(&stored).unwrap();
        store.insert_run(&session(), RunKind::Drag, vec![pull(1, 5., 1000.)]);

        assert!(
            detect_gear_ratios(&mut store, &session().vehicle_name)
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.load_gear_ratios(&session().vehicle_name).unwrap(),
            Some(stored)
        );
    }

    #[test]
    fn test_sparse_data_clears_profile() {
        let mut store = MemoryRunStore::new();
        store
            .save_gear_ratios(&GearRatioProfile {
                vehicle_name: session().vehicle_name,
                ratios: BTreeMap::from([(1, 0.5)]),
            })
            .unwrap();
        store.insert_run(&session(), RunKind::Drag, gear_samples(3, 5, 0.02));

        assert!(
            detect_gear_ratios(&mut store, &session().vehicle_name)
                .unwrap()
                .is_none()
        );
        let profile = store
            .load_gear_ratios(&session().vehicle_name)
            .unwrap()
            .unwrap();
        assert!(profile.ratios.is_empty());
    }
}
