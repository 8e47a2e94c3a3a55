use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::telemetry::Sample;

use super::mean;

/// Samples above this lateral load are counted as cornering
const CORNER_MIN_LAT_G: f64 = 0.5;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorStats {
    pub duration_s: f64,
    /// Mean speed of the cornering samples
    pub mean_corner_speed_kmh: Option<f64>,
    pub peak_lateral_g: Option<f64>,
    pub peak_braking_g: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorComparison {
    pub sector: i32,
    pub a: SectorStats,
    pub b: Option<SectorStats>,
    /// A minus B, when both runs cover the sector
    pub duration_delta_s: Option<f64>,
}

/// KPIs of one sector, `None` when the run has no sample in it
pub fn sector_stats(samples: &[Sample], sector: i32) -> Option<SectorStats> {
    let in_sector = samples.iter().filter(|s| s.sector == sector).collect_vec();
    let (start, end) = in_sector
        .iter()
        .map(|s| s.elapsed_s)
        .minmax()
        .into_option()?;

    let corner_speeds = in_sector
        .iter()
        .filter(|s| s.lat_g.is_some_and(|g| g.abs() > CORNER_MIN_LAT_G))
        .map(|s| s.speed_kmh)
        .collect_vec();
    let peak_lateral_g = in_sector
        .iter()
        .filter_map(|s| s.lat_g)
        .map(f64::abs)
        .max_by(f64::total_cmp);
    let peak_braking_g = in_sector
        .iter()
        .filter_map(|s| s.lon_g)
        .min_by(f64::total_cmp)
        .map(f64::abs);

    Some(SectorStats {
        duration_s: end - start,
        mean_corner_speed_kmh: mean(&corner_speeds),
        peak_lateral_g,
        peak_braking_g,
    })
}

/// Compare every non-negative sector that run A covers on track.
///
/// Sectors are discovered from A's samples with a positive lap distance.
pub fn compare_sectors(a: &[Sample], b: &[Sample]) -> Vec<SectorComparison> {
    a.iter()
        .filter(|s| s.lap_distance_m > 0. && s.sector >= 0)
        .map(|s| s.sector)
        .unique()
        .sorted()
        .filter_map(|sector| {
            let stats_a = sector_stats(a, sector)?;
            let stats_b = sector_stats(b, sector);
            let duration_delta_s = stats_b
                .as_ref()
                .filter(|stats| stats.duration_s > 0. && stats_a.duration_s > 0.)
                .map(|stats| stats_a.duration_s - stats.duration_s);
            Some(SectorComparison {
                sector,
                a: stats_a,
                b: stats_b,
                duration_delta_s,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn lap_sample(elapsed_s: f64, sector: i32, speed_kmh: f64, lat_g: f64, lon_g: f64) -> Sample {
        Sample {
            elapsed_s,
            sector,
            speed_kmh,
            lat_g: Some(lat_g),
            lon_g: Some(lon_g),
            lap_distance_m: 100. + elapsed_s * 50.,
            ..Default::default()
        }
    }

    fn lap(sector_lengths_s: &[f64], offset_s: f64) -> Vec<Sample> {
        let mut samples = Vec::new();
        let mut t = offset_s;
        for (sector, length) in sector_lengths_s.iter().enumerate() {
            let end = t + length;
            while t <= end + 1e-9 {
                samples.push(lap_sample(t, sector as i32, 150., 1.2, -1.8));
                t += 0.5;
            }
        }
        samples
    }

    #[test]
    fn test_sector_stats() {
        let samples = vec![
            lap_sample(10., 1, 200., 0.2, 0.1),
            lap_sample(11., 1, 120., -1.5, -2.5),
            lap_sample(12., 1, 100., 0.9, -0.3),
            lap_sample(13., 2, 180., 0.1, 0.2),
        ];
        let stats = sector_stats(&samples, 1).unwrap();

        assert_abs_diff_eq!(stats.duration_s, 2.);
        assert_abs_diff_eq!(stats.mean_corner_speed_kmh.unwrap(), 110.);
        assert_abs_diff_eq!(stats.peak_lateral_g.unwrap(), 1.5);
        assert_abs_diff_eq!(stats.peak_braking_g.unwrap(), 2.5);
        assert!(sector_stats(&samples, 5).is_none());
    }

    #[test]
    fn test_straight_sector_has_no_corner_speed() {
        let samples = vec![
            lap_sample(0., 0, 250., 0.1, 0.3),
            lap_sample(1., 0, 260., -0.2, 0.3),
        ];
        let stats = sector_stats(&samples, 0).unwrap();
        assert_eq!(stats.mean_corner_speed_kmh, None);
    }

    #[test]
    fn test_sector_delta() {
        let a = lap(&[20., 30., 25.], 0.);
        let b = lap(&[21., 29., 25.], 100.);
        let sectors = compare_sectors(&a, &b);

        assert_eq!(sectors.iter().map(|s| s.sector).collect_vec(), vec![0, 1, 2]);
        assert_abs_diff_eq!(sectors[0].duration_delta_s.unwrap(), -1., epsilon = 1e-9);
        assert_abs_diff_eq!(sectors[1].duration_delta_s.unwrap(), 1., epsilon = 1e-9);
    }

    #[test]
    fn test_sector_missing_in_b() {
        let a = lap(&[10., 10.], 0.);
        let b = lap(&[10.], 0.);
        let sectors = compare_sectors(&a, &b);

        assert_eq!(sectors.len(), 2);
        assert!(sectors[1].b.is_none());
        assert_eq!(sectors[1].duration_delta_s, None);
    }

    #[test]
    fn test_pit_sector_ignored() {
        let mut a = lap(&[10.], 0.);
        a.push(lap_sample(30., -1, 60., 0., 0.));
        assert!(compare_sectors(&a, &a).iter().all(|s| s.sector >= 0));
    }
}
