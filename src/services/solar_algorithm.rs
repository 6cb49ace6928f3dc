/// ============================================================
///  Per-array Solar Power Estimator
///
///  Algorithm pipeline (per hourly weather sample):
///   1. Solar geometry  – Spencer declination & equation of time,
///                        hour angle, elevation, azimuth at mid-hour
///   2. Irradiance components – GHI / DNI / DHI from the provider,
///                        missing ones derived (closure relation or
///                        Erbs decomposition)
///   3. Transposition   – isotropic sky: beam + sky diffuse + ground
///                        reflected on the tilted plane, optional
///                        horizon shading of the beam
///   4. Cell temperature – Faiman model
///   5. Power output     – P = kWp × (G_poa/1000) × η_temp × (1 − damping)
///                        clamped to [0, kWp]
/// ============================================================

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use std::f64::consts::PI;

use crate::config::{ArrayConfig, Coordinates, MAX_FORECAST_DAYS};
use crate::error::ForecastError;
use crate::models::forecast::{ArrayForecastPoint, ArrayForecastResult};
use crate::models::weather::{WeatherSample, WeatherSeries};

// ─── Physical constants ──────────────────────────────────────
const SC: f64 = 1361.0; // Solar constant W/m²
const DEG: f64 = PI / 180.0;
const ALBEDO: f64 = 0.20;
const TEMP_COEFFICIENT: f64 = -0.004; // 1/°C, typical c-Si
const FAIMAN_U0: f64 = 25.0;
const FAIMAN_U1: f64 = 6.84;
const DEFAULT_WIND_M_S: f64 = 1.0;
const DEFAULT_AMBIENT_C: f64 = 25.0;
const MAX_VALID_IRRADIANCE: f64 = 1500.0;
// Below this cos(zenith) the beam/diffuse split is numerically meaningless.
const MIN_COS_ZENITH: f64 = 0.065;

#[derive(Debug, Clone, Copy)]
pub struct SolarPosition {
    pub elevation_deg: f64,
    /// Degrees from north, clockwise
    pub azimuth_deg: f64,
    pub cos_zenith: f64,
    /// Eccentricity-corrected extraterrestrial normal irradiance (W/m²)
    pub extraterrestrial_w_m2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Irradiance {
    ghi: f64,
    dni: f64,
    dhi: f64,
}

/// Turns a weather series into an hourly forecast for one array.
///
/// Pure: the same inputs always give the same output. Hours whose irradiance is
/// missing or invalid produce 0 kW instead of failing the sequence; duplicate or
/// out-of-order samples are skipped and gaps are filled with 0 kW hours. Samples
/// more than `MAX_FORECAST_DAYS` after the first one are ignored.
/// Fails only when the array or its location violates its declared ranges.
pub fn estimate(
    config: &ArrayConfig,
    location: &Coordinates,
    series: &WeatherSeries,
    computed_at: DateTime<Utc>,
) -> Result<ArrayForecastResult, ForecastError> {
    config.validate()?;
    location
        .validate()
        .map_err(|e| ForecastError::InvalidConfig(format!("{}: {}", config.name, e)))?;

    let hour = Duration::hours(1);
    let mut points: Vec<ArrayForecastPoint> = Vec::with_capacity(series.samples.len());
    let mut horizon_end = None;

    for sample in &series.samples {
        let Ok(timestamp) = sample.timestamp.duration_trunc(hour) else {
            continue;
        };
        // The series never covers more than the longest horizon from its first hour.
        let end = *horizon_end.get_or_insert(timestamp + Duration::days(i64::from(MAX_FORECAST_DAYS)));
        if timestamp >= end {
            continue;
        }
        if let Some(last) = points.last().map(|p| p.timestamp) {
            if timestamp <= last {
                continue;
            }
            let mut gap = last + hour;
            while gap < timestamp {
                points.push(ArrayForecastPoint::new(gap, 0.0));
                gap += hour;
            }
        }
        points.push(estimate_hour(config, location, timestamp, sample));
    }

    Ok(ArrayForecastResult {
        array_name: config.name.clone(),
        points,
        computed_at,
        source_weather_timestamp: series.issued_at,
    })
}

fn estimate_hour(
    config: &ArrayConfig,
    location: &Coordinates,
    timestamp: DateTime<Utc>,
    sample: &WeatherSample,
) -> ArrayForecastPoint {
    let sun = solar_position(location.latitude, location.longitude, timestamp + Duration::minutes(30));
    let ambient_c = sample
        .temperature_c
        .filter(|t| t.is_finite())
        .unwrap_or(DEFAULT_AMBIENT_C);

    let mut point = ArrayForecastPoint::new(timestamp, 0.0);
    point.cell_temp_c = ambient_c;
    point.cloud_cover_pct = sample.cloud_cover_pct.filter(|c| c.is_finite());

    let Some(irradiance) = resolve_components(sample, &sun) else {
        return point;
    };
    let poa = plane_of_array(config, &sun, &irradiance);

    // Faiman 2008: T_cell = T_ambient + G_poa / (U0 + U1 * wind)
    let wind = sample
        .wind_speed_m_s
        .filter(|w| w.is_finite() && *w >= 0.0)
        .unwrap_or(DEFAULT_WIND_M_S);
    let cell_temp_c = ambient_c + poa / (FAIMAN_U0 + FAIMAN_U1 * wind);

    let temp_factor = 1.0 + TEMP_COEFFICIENT * (cell_temp_c - 25.0);
    let raw_kw = config.capacity_kwp * (poa / 1000.0) * temp_factor * (1.0 - config.damping_factor);
    let power_kw = if raw_kw.is_finite() {
        raw_kw.clamp(0.0, config.capacity_kwp)
    } else {
        0.0
    };

    point.power_kw = power_kw;
    point.energy_kwh = power_kw;
    point.poa_irradiance_w_m2 = poa;
    point.cell_temp_c = cell_temp_c;
    point
}

/// Sun position for a UTC instant at the given location.
pub fn solar_position(lat_deg: f64, lon_deg: f64, utc: DateTime<Utc>) -> SolarPosition {
    // ── 1. Time decomposition ──────────────────────────────────
    let doy = utc.ordinal() as f64;
    let ut_h = utc.hour() as f64 + utc.minute() as f64 / 60.0 + utc.second() as f64 / 3600.0;

    // ── 2. Declination & equation of time (Spencer 1971) ───────
    let b = 2.0 * PI * (doy - 1.0) / 365.0;
    let decl = 0.006918 - 0.399912 * b.cos() + 0.070257 * b.sin()
        - 0.006758 * (2.0 * b).cos()
        + 0.000907 * (2.0 * b).sin()
        - 0.002697 * (3.0 * b).cos()
        + 0.00148 * (3.0 * b).sin(); // radians
    let eot_min = 229.18
        * (0.000075 + 0.001868 * b.cos()
            - 0.032077 * b.sin()
            - 0.014615 * (2.0 * b).cos()
            - 0.04089 * (2.0 * b).sin());

    // ── 3. True solar time & hour angle ────────────────────────
    let solar_time_h = ut_h + lon_deg / 15.0 + eot_min / 60.0;
    let omega_deg = 15.0 * (solar_time_h - 12.0);
    let omega = omega_deg * DEG;

    // ── 4. Elevation ───────────────────────────────────────────
    let lat = lat_deg * DEG;
    let sin_alpha = (lat.sin() * decl.sin() + lat.cos() * decl.cos() * omega.cos()).clamp(-1.0, 1.0);
    let alpha = sin_alpha.asin();

    // ── 5. Azimuth (N = 0°, clockwise) ─────────────────────────
    let denom = alpha.cos() * lat.cos();
    let cos_az = if denom.abs() > 1e-9 {
        (decl.sin() - sin_alpha * lat.sin()) / denom
    } else {
        0.0
    };
    let az_abs = cos_az.clamp(-1.0, 1.0).acos() / DEG;
    // Hour angle wraps every 24h; afternoon means sin(omega) > 0
    let azimuth_deg = if omega.sin() > 0.0 { 360.0 - az_abs } else { az_abs };

    // ── 6. Extraterrestrial irradiance ─────────────────────────
    let e0 = SC
        * (1.00011 + 0.034221 * b.cos() + 0.00128 * b.sin() + 0.000719 * (2.0 * b).cos()
            + 0.000077 * (2.0 * b).sin());

    SolarPosition {
        elevation_deg: alpha / DEG,
        azimuth_deg,
        cos_zenith: sin_alpha,
        extraterrestrial_w_m2: e0,
    }
}

fn valid_irradiance(value: f64) -> bool {
    value.is_finite() && (0.0..=MAX_VALID_IRRADIANCE).contains(&value)
}

/// Completes the GHI/DNI/DHI triple. `None` when a supplied value is invalid or
/// too little is known to derive the rest.
fn resolve_components(sample: &WeatherSample, sun: &SolarPosition) -> Option<Irradiance> {
    let raw = [sample.ghi_w_m2, sample.dni_w_m2, sample.dhi_w_m2];
    if raw.iter().flatten().any(|v| !valid_irradiance(*v)) {
        return None;
    }

    let cos_z = sun.cos_zenith.max(0.0);
    let beam_from = |ghi: f64, dhi: f64| {
        if cos_z > MIN_COS_ZENITH {
            ((ghi - dhi) / cos_z).clamp(0.0, sun.extraterrestrial_w_m2)
        } else {
            0.0
        }
    };

    let irradiance = match (sample.ghi_w_m2, sample.dni_w_m2, sample.dhi_w_m2) {
        (Some(ghi), Some(dni), Some(dhi)) => Irradiance { ghi, dni, dhi },
        (Some(ghi), Some(dni), None) => Irradiance { ghi, dni, dhi: (ghi - dni * cos_z).max(0.0) },
        (Some(ghi), None, Some(dhi)) => Irradiance { ghi, dni: beam_from(ghi, dhi), dhi },
        (Some(ghi), None, None) => {
            let dhi = ghi * erbs_diffuse_fraction(ghi, sun);
            Irradiance { ghi, dni: beam_from(ghi, dhi), dhi }
        }
        (None, Some(dni), Some(dhi)) => Irradiance { ghi: dni * cos_z + dhi, dni, dhi },
        _ => return None,
    };
    Some(irradiance)
}

/// Erbs et al. (1982) diffuse fraction from the clearness index.
fn erbs_diffuse_fraction(ghi: f64, sun: &SolarPosition) -> f64 {
    if sun.cos_zenith <= MIN_COS_ZENITH {
        return 1.0;
    }
    let kt = (ghi / (sun.extraterrestrial_w_m2 * sun.cos_zenith)).clamp(0.0, 1.0);
    if kt <= 0.22 {
        1.0 - 0.09 * kt
    } else if kt <= 0.80 {
        0.9511 - 0.1604 * kt + 4.388 * kt.powi(2) - 16.638 * kt.powi(3) + 12.336 * kt.powi(4)
    } else {
        0.165
    }
}

/// Isotropic-sky (Liu–Jordan) transposition onto the array plane.
fn plane_of_array(config: &ArrayConfig, sun: &SolarPosition, irr: &Irradiance) -> f64 {
    let tilt = config.declination_deg * DEG;
    let sin_zenith = (1.0 - sun.cos_zenith.powi(2)).max(0.0).sqrt();
    let az_diff = (sun.azimuth_deg - config.azimuth_deg) * DEG;
    let cos_aoi = sun.cos_zenith * tilt.cos() + sin_zenith * tilt.sin() * az_diff.cos();

    let sun_visible = sun.elevation_deg > 0.0
        && !config
            .horizon_profile
            .as_deref()
            .is_some_and(|profile| sun.elevation_deg < horizon_elevation(profile, sun.azimuth_deg));

    let beam = if sun_visible { irr.dni * cos_aoi.max(0.0) } else { 0.0 };
    let sky_diffuse = irr.dhi * (1.0 + tilt.cos()) / 2.0;
    let reflected = irr.ghi * ALBEDO * (1.0 - tilt.cos()) / 2.0;

    (beam + sky_diffuse + reflected).max(0.0)
}

/// Horizon line elevation at a compass azimuth, interpolated between the
/// evenly spaced profile points.
fn horizon_elevation(profile: &[f64], azimuth_deg: f64) -> f64 {
    match profile.len() {
        0 => 0.0,
        1 => profile[0],
        n => {
            let step = 360.0 / n as f64;
            let pos = azimuth_deg.rem_euclid(360.0) / step;
            let lower = pos.floor() as usize % n;
            let upper = (lower + 1) % n;
            let frac = pos - pos.floor();
            profile[lower] + (profile[upper] - profile[lower]) * frac
        }
    }
}
