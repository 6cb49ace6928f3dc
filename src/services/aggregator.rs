use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, DurationRound, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::ArrayConfig;
use crate::models::forecast::{
    ArrayContribution, ArrayForecastView, CacheEntry, EnergyDashboardForecast, EnergyInterval, ForecastSensors,
    ForecastWindow, HourlyForecastPoint, SystemTotals, TotalSystemForecast,
};
use crate::services::forecast_cache::CacheSnapshot;

/// Length of the `hourly_forecast` sensor attribute.
pub const SENSOR_HOURLY_POINTS: usize = 24;

pub fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::hours(1)).unwrap_or(t)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    // Some zones skip midnight on DST days; the day then starts at the first valid hour.
    (0..3)
        .filter_map(|h| date.and_hms_opt(h, 0, 0))
        .find_map(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc())
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Local calendar day `offset_days` after the one containing `now`.
    pub fn day(tz: Tz, now: DateTime<Utc>, offset_days: i64) -> Self {
        let date = now.with_timezone(&tz).date_naive() + Duration::days(offset_days);
        Self {
            start: local_midnight(tz, date),
            end: local_midnight(tz, date + Duration::days(1)),
        }
    }

    pub fn for_forecast(window: ForecastWindow, tz: Tz, now: DateTime<Utc>) -> Self {
        match window {
            ForecastWindow::Today => Self::day(tz, now, 0),
            ForecastWindow::Tomorrow => Self::day(tz, now, 1),
            ForecastWindow::RemainingToday => {
                let today = Self::day(tz, now, 0);
                Self { start: now.max(today.start), end: today.end }
            }
        }
    }

    /// Fraction of the hour starting at `timestamp` that falls inside the window.
    fn overlap(&self, timestamp: DateTime<Utc>) -> f64 {
        let start = timestamp.max(self.start);
        let end = (timestamp + Duration::hours(1)).min(self.end);
        if end <= start {
            0.0
        } else {
            (end - start).num_seconds() as f64 / 3600.0
        }
    }
}

/// Derives the sensor set from one hour-aligned series.
///
/// Used unchanged for a single array and for the combined system series, so the
/// system peak is the maximum of per-hour sums rather than a sum of peaks.
pub fn sensors(series: &[HourlyForecastPoint], now: DateTime<Utc>, tz: Tz) -> ForecastSensors {
    let today = Window::day(tz, now, 0);
    let tomorrow = Window::day(tz, now, 1);
    let remaining = Window::for_forecast(ForecastWindow::RemainingToday, tz, now);
    let current = hour_start(now);
    let next = current + Duration::hours(1);

    let mut out = ForecastSensors::default();
    // Current power comes from the point at or immediately preceding `now`.
    let mut latest: Option<DateTime<Utc>> = None;
    for point in series {
        if point.timestamp <= now && latest.is_none_or(|t| point.timestamp > t) {
            latest = Some(point.timestamp);
            out.current_power_kw = point.power_kw;
        }
        if point.timestamp == current {
            out.this_hour_energy_kwh = point.energy_kwh;
        } else if point.timestamp == next {
            out.next_hour_energy_kwh = point.energy_kwh;
        }

        let share = today.overlap(point.timestamp);
        if share > 0.0 {
            out.today_energy_kwh += point.energy_kwh * share;
            out.peak_power_today_kw = out.peak_power_today_kw.max(point.power_kw);
        }
        let share = tomorrow.overlap(point.timestamp);
        if share > 0.0 {
            out.tomorrow_energy_kwh += point.energy_kwh * share;
            out.peak_power_tomorrow_kw = out.peak_power_tomorrow_kw.max(point.power_kw);
        }
        let share = remaining.overlap(point.timestamp);
        if share > 0.0 {
            out.remaining_today_energy_kwh += point.energy_kwh * share;
            out.peak_power_remaining_today_kw = out.peak_power_remaining_today_kw.max(point.power_kw);
        }
    }
    out.hourly_forecast = hourly_window(series, current, SENSOR_HOURLY_POINTS);
    out
}

fn entry_series(entry: &CacheEntry) -> Vec<HourlyForecastPoint> {
    entry.result.points.iter().map(HourlyForecastPoint::from).collect()
}

pub fn array_view(config: &ArrayConfig, entry: &CacheEntry, now: DateTime<Utc>, tz: Tz) -> ArrayForecastView {
    ArrayForecastView {
        array: config.clone(),
        sensors: sensors(&entry_series(entry), now, tz),
        last_success_at: entry.last_success_at,
        computed_at: entry.result.computed_at,
        source_weather_timestamp: entry.result.source_weather_timestamp,
        stale: entry.is_stale(),
        last_error: entry.last_error.clone(),
    }
}

/// Per-hour sum over the configured arrays that have data.
///
/// The result covers the union of the arrays' hours. Arrays without an entry do
/// not participate, and entries for names no longer configured are ignored.
pub fn combined_series(configs: &[ArrayConfig], snapshot: &CacheSnapshot) -> Vec<HourlyForecastPoint> {
    let mut by_hour: BTreeMap<DateTime<Utc>, (f64, f64)> = BTreeMap::new();
    for config in configs {
        let Some(entry) = snapshot.entries.get(&config.name) else {
            continue;
        };
        for point in &entry.result.points {
            let slot = by_hour.entry(point.timestamp).or_insert((0.0, 0.0));
            slot.0 += point.power_kw;
            slot.1 += point.energy_kwh;
        }
    }

    by_hour
        .into_iter()
        .map(|(timestamp, (power_kw, energy_kwh))| HourlyForecastPoint { timestamp, power_kw, energy_kwh })
        .collect()
}

pub fn aggregate(configs: &[ArrayConfig], snapshot: &CacheSnapshot, now: DateTime<Utc>, tz: Tz) -> SystemTotals {
    let mut contributions = Vec::with_capacity(configs.len());
    let mut oldest_success_at: Option<DateTime<Utc>> = None;
    let mut newest_success_at: Option<DateTime<Utc>> = None;

    for config in configs {
        let contribution = match snapshot.entries.get(&config.name) {
            Some(entry) => {
                let s = sensors(&entry_series(entry), now, tz);
                oldest_success_at = Some(oldest_success_at.map_or(entry.last_success_at, |t| t.min(entry.last_success_at)));
                newest_success_at = Some(newest_success_at.map_or(entry.last_success_at, |t| t.max(entry.last_success_at)));
                ArrayContribution {
                    array_name: config.name.clone(),
                    has_data: true,
                    stale: entry.is_stale(),
                    current_power_kw: s.current_power_kw,
                    today_energy_kwh: s.today_energy_kwh,
                    tomorrow_energy_kwh: s.tomorrow_energy_kwh,
                    last_success_at: Some(entry.last_success_at),
                    last_error: entry.last_error.clone(),
                }
            }
            None => ArrayContribution {
                array_name: config.name.clone(),
                has_data: false,
                stale: false,
                current_power_kw: 0.0,
                today_energy_kwh: 0.0,
                tomorrow_energy_kwh: 0.0,
                last_success_at: None,
                last_error: snapshot.last_failure(&config.name).cloned(),
            },
        };
        contributions.push(contribution);
    }

    SystemTotals {
        sensors: sensors(&combined_series(configs, snapshot), now, tz),
        arrays_configured: configs.len(),
        arrays_with_data: contributions.iter().filter(|c| c.has_data).count(),
        total_kwp: configs.iter().map(|c| c.capacity_kwp).sum(),
        contributions,
        oldest_success_at,
        newest_success_at,
        generated_at: now,
    }
}

/// Exactly `hours` consecutive points from `start`; hours without data are zero.
pub fn hourly_window(series: &[HourlyForecastPoint], start: DateTime<Utc>, hours: usize) -> Vec<HourlyForecastPoint> {
    let by_hour: HashMap<DateTime<Utc>, &HourlyForecastPoint> = series.iter().map(|p| (p.timestamp, p)).collect();

    (0..hours as i64)
        .map(|i| {
            let timestamp = start + Duration::hours(i);
            match by_hour.get(&timestamp) {
                Some(point) => (*point).clone(),
                None => HourlyForecastPoint { timestamp, power_kw: 0.0, energy_kwh: 0.0 },
            }
        })
        .collect()
}

pub fn energy_dashboard(
    series: &[HourlyForecastPoint],
    forecast_type: ForecastWindow,
    now: DateTime<Utc>,
    tz: Tz,
) -> EnergyDashboardForecast {
    let window = Window::for_forecast(forecast_type, tz, now);

    let mut total = 0.0;
    let forecast = series
        .iter()
        .filter_map(|point| {
            let share = window.overlap(point.timestamp);
            if share <= 0.0 {
                return None;
            }
            let energy = point.energy_kwh * share;
            total += energy;
            Some(EnergyInterval {
                start: point.timestamp.max(window.start),
                end: (point.timestamp + Duration::hours(1)).min(window.end),
                energy_kwh: round3(energy),
            })
        })
        .collect();

    EnergyDashboardForecast {
        forecast,
        total_energy_kwh: round3(total),
        forecast_type,
        generated_at: now,
    }
}

/// Combined hourly forecast for `hours` hours from the current hour. Only hours
/// with data are listed, so `data_points` may be lower than `hours_requested`.
pub fn total_system_forecast(
    configs: &[ArrayConfig],
    series: &[HourlyForecastPoint],
    hours: u32,
    now: DateTime<Utc>,
) -> TotalSystemForecast {
    let start = hour_start(now);
    let end = start + Duration::hours(i64::from(hours));

    let forecast: Vec<HourlyForecastPoint> = series
        .iter()
        .filter(|p| p.timestamp >= start && p.timestamp < end)
        .map(|p| HourlyForecastPoint {
            timestamp: p.timestamp,
            power_kw: round3(p.power_kw),
            energy_kwh: round3(p.energy_kwh),
        })
        .collect();
    let total: f64 = series
        .iter()
        .filter(|p| p.timestamp >= start && p.timestamp < end)
        .map(|p| p.energy_kwh)
        .sum();

    TotalSystemForecast {
        data_points: forecast.len(),
        forecast,
        total_energy_kwh: round3(total),
        system_kwp: configs.iter().map(|c| c.capacity_kwp).sum(),
        arrays_count: configs.len(),
        hours_requested: hours,
        generated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::forecast::{ArrayForecastPoint, ArrayForecastResult, FailureRecord};
    use std::sync::Arc;

    fn utc(day: u32, hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, min, 0).unwrap()
    }

    /// Entry for an array producing `power` kW at the given hours of 21 June
    /// and zero for every other hour of 21 and 22 June.
    fn entry(name: &str, hourly: &[(u32, f64)]) -> CacheEntry {
        let start = utc(21, 0, 0);
        let points = (0..48)
            .map(|i| {
                let ts = start + Duration::hours(i);
                let power = if i < 24 {
                    hourly.iter().find(|(h, _)| i64::from(*h) == i).map_or(0.0, |(_, p)| *p)
                } else {
                    0.0
                };
                ArrayForecastPoint::new(ts, power)
            })
            .collect();
        CacheEntry {
            result: Arc::new(ArrayForecastResult {
                array_name: name.to_string(),
                points,
                computed_at: utc(21, 5, 0),
                source_weather_timestamp: utc(21, 5, 0),
            }),
            last_success_at: utc(21, 5, 0),
            last_error: None,
        }
    }

    fn snapshot(entries: Vec<CacheEntry>) -> CacheSnapshot {
        CacheSnapshot {
            entries: entries.into_iter().map(|e| (e.result.array_name.clone(), e)).collect(),
            pending_failures: HashMap::new(),
        }
    }

    fn configs(names: &[&str]) -> Vec<ArrayConfig> {
        names.iter().map(|n| ArrayConfig::new(*n, 30.0, 180.0, 5.0)).collect()
    }

    #[test]
    fn test_system_peak_is_max_of_hourly_sums() {
        let snap = snapshot(vec![
            entry("A", &[(12, 3.0)]),
            entry("B", &[(12, 1.0), (14, 2.0)]),
        ]);
        let totals = aggregate(&configs(&["A", "B"]), &snap, utc(21, 8, 0), Tz::UTC);

        assert_eq!(totals.sensors.peak_power_today_kw, 4.0);
        assert!((totals.sensors.today_energy_kwh - 6.0).abs() < 1e-9);
        assert_eq!(totals.sensors.peak_power_tomorrow_kw, 0.0);
        assert_eq!(totals.arrays_with_data, 2);
        assert_eq!(totals.total_kwp, 10.0);
    }

    #[test]
    fn test_missing_array_does_not_mask_others() {
        let mut snap = snapshot(vec![entry("A", &[(12, 3.0)])]);
        let failure = FailureRecord { at: utc(21, 6, 0), kind: ErrorKind::Network, message: "down".into() };
        snap.pending_failures.insert("C".to_string(), failure.clone());

        let totals = aggregate(&configs(&["A", "B", "C"]), &snap, utc(21, 12, 10), Tz::UTC);

        assert_eq!(totals.arrays_configured, 3);
        assert_eq!(totals.arrays_with_data, 1);
        assert_eq!(totals.sensors.current_power_kw, 3.0);
        assert_eq!(totals.sensors.peak_power_today_kw, 3.0);
        assert!(!totals.contributions[1].has_data);
        assert_eq!(totals.contributions[2].last_error, Some(failure));
        assert_eq!(totals.oldest_success_at, Some(utc(21, 5, 0)));
    }

    #[test]
    fn test_unconfigured_entries_are_ignored() {
        let snap = snapshot(vec![entry("A", &[(12, 3.0)]), entry("gone", &[(12, 9.0)])]);
        let totals = aggregate(&configs(&["A"]), &snap, utc(21, 12, 0), Tz::UTC);
        assert_eq!(totals.arrays_with_data, 1);
        assert!(totals.arrays_with_data <= totals.arrays_configured);
        assert_eq!(totals.sensors.current_power_kw, 3.0);
    }

    #[test]
    fn test_remaining_today_prorates_current_hour() {
        let series = entry_series(&entry("A", &[(12, 2.0), (13, 1.0), (9, 4.0)]));
        let s = sensors(&series, utc(21, 12, 30), Tz::UTC);

        assert_eq!(s.current_power_kw, 2.0);
        assert_eq!(s.this_hour_energy_kwh, 2.0);
        assert_eq!(s.next_hour_energy_kwh, 1.0);
        assert!((s.remaining_today_energy_kwh - 2.0).abs() < 1e-9);
        assert_eq!(s.peak_power_remaining_today_kw, 2.0);
        assert_eq!(s.peak_power_today_kw, 4.0);
        assert_eq!(s.hourly_forecast.len(), SENSOR_HOURLY_POINTS);
        assert_eq!(s.hourly_forecast[0].timestamp, utc(21, 12, 0));
    }

    #[test]
    fn test_current_power_uses_preceding_point() {
        let full = entry_series(&entry("A", &[(11, 1.5), (12, 3.0)]));

        let mut gap = full.clone();
        gap.retain(|p| p.timestamp != utc(21, 13, 0));
        let s = sensors(&gap, utc(21, 13, 40), Tz::UTC);
        assert_eq!(s.current_power_kw, 3.0);
        assert_eq!(s.this_hour_energy_kwh, 0.0);

        let truncated: Vec<_> = full.into_iter().filter(|p| p.timestamp <= utc(21, 12, 0)).collect();
        let s = sensors(&truncated, utc(21, 15, 20), Tz::UTC);
        assert_eq!(s.current_power_kw, 3.0);
        assert_eq!(s.this_hour_energy_kwh, 0.0);

        let s = sensors(&truncated, utc(21, 11, 0), Tz::UTC);
        assert_eq!(s.current_power_kw, 1.5);
    }

    #[test]
    fn test_day_boundaries_follow_timezone() {
        // Berlin is UTC+2 in June: 22:00 UTC on the 21st is already the 22nd locally.
        let series = entry_series(&entry("A", &[(21, 1.0), (22, 5.0)]));
        let s = sensors(&series, utc(21, 10, 0), Tz::Europe__Berlin);
        assert_eq!(s.today_energy_kwh, 1.0);
        assert_eq!(s.tomorrow_energy_kwh, 5.0);
        assert_eq!(s.peak_power_tomorrow_kw, 5.0);

        let window = Window::day(Tz::Europe__Berlin, utc(21, 10, 0), 0);
        assert_eq!(window.start, utc(20, 22, 0));
        assert_eq!(window.end, utc(21, 22, 0));
    }

    #[test]
    fn test_dst_transition_days() {
        let london = Tz::Europe__London;
        // Clocks go forward at 01:00 UTC on 30 March 2025.
        let spring = Utc.with_ymd_and_hms(2025, 3, 30, 0, 0, 0).unwrap();
        let window = Window::day(london, spring + Duration::hours(10), 0);
        assert_eq!(window.start, spring);
        assert_eq!(window.end - window.start, Duration::hours(23));

        let flat: Vec<HourlyForecastPoint> = (0..48)
            .map(|i| HourlyForecastPoint::from(&ArrayForecastPoint::new(spring + Duration::hours(i), 1.0)))
            .collect();
        let s = sensors(&flat, spring + Duration::hours(10), london);
        assert!((s.today_energy_kwh - 23.0).abs() < 1e-9);
        assert!((s.tomorrow_energy_kwh - 24.0).abs() < 1e-9);

        // Clocks go back at 01:00 UTC on 26 October 2025.
        let autumn = Utc.with_ymd_and_hms(2025, 10, 25, 23, 0, 0).unwrap();
        let window = Window::day(london, autumn + Duration::hours(12), 0);
        assert_eq!(window.start, autumn);
        assert_eq!(window.end - window.start, Duration::hours(25));
    }

    #[test]
    fn test_hourly_window_is_gap_free() {
        let mut series = entry_series(&entry("A", &[(12, 2.0)]));
        series.remove(5);
        let window = hourly_window(&series, utc(21, 0, 0), 3 * 24);

        assert_eq!(window.len(), 72);
        for pair in window.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::hours(1));
        }
        assert_eq!(window[5].power_kw, 0.0);
        assert_eq!(window[12].power_kw, 2.0);
        assert_eq!(window[71].timestamp, utc(23, 23, 0));
    }

    #[test]
    fn test_energy_dashboard_windows() {
        let series = entry_series(&entry("A", &[(12, 1.23456), (13, 2.0)]));

        let today = energy_dashboard(&series, ForecastWindow::Today, utc(21, 12, 30), Tz::UTC);
        assert_eq!(today.forecast.len(), 24);
        assert_eq!(today.forecast[12].energy_kwh, 1.235);
        assert_eq!(today.total_energy_kwh, 3.235);

        let remaining = energy_dashboard(&series, ForecastWindow::RemainingToday, utc(21, 12, 30), Tz::UTC);
        assert_eq!(remaining.forecast[0].start, utc(21, 12, 30));
        assert_eq!(remaining.forecast[0].energy_kwh, 0.617);
        assert_eq!(remaining.forecast_type, ForecastWindow::RemainingToday);

        let tomorrow = energy_dashboard(&series, ForecastWindow::Tomorrow, utc(21, 12, 30), Tz::UTC);
        assert_eq!(tomorrow.forecast.len(), 24);
        assert_eq!(tomorrow.total_energy_kwh, 0.0);
    }

    #[test]
    fn test_total_system_forecast_from_current_hour() {
        let cfg = configs(&["A", "B"]);
        let snap = snapshot(vec![entry("A", &[(12, 3.0)]), entry("B", &[(12, 1.0), (14, 2.0)])]);
        let series = combined_series(&cfg, &snap);

        let total = total_system_forecast(&cfg, &series, 3, utc(21, 12, 45));
        assert_eq!(total.data_points, 3);
        assert_eq!(total.forecast[0].timestamp, utc(21, 12, 0));
        assert_eq!(total.forecast[0].power_kw, 4.0);
        assert_eq!(total.total_energy_kwh, 6.0);
        assert_eq!(total.system_kwp, 10.0);
        assert_eq!(total.arrays_count, 2);

        let beyond = total_system_forecast(&cfg, &series, 168, utc(22, 20, 0));
        assert_eq!(beyond.hours_requested, 168);
        assert_eq!(beyond.data_points, 4);
    }
}
