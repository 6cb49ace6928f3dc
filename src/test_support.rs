use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{
    ArrayConfig, Config, Coordinates, LocationConfig, MqttConfig, ServerConfig, WeatherConfig,
};
use crate::error::ForecastError;
use crate::models::weather::{WeatherSample, WeatherSeries};
use crate::services::coordinator::{CoordinatorSettings, UpdateCoordinator};
use crate::services::forecast_cache::ForecastCache;
use crate::services::solar_algorithm::solar_position;
use crate::services::weather_client::WeatherProvider;

pub fn system_location() -> Coordinates {
    Coordinates { latitude: 48.1, longitude: 11.6 }
}

/// Array with its own latitude so the scripted provider can target it.
pub fn array_at(name: &str, latitude: f64) -> ArrayConfig {
    ArrayConfig::new(name, 30.0, 180.0, 5.0).with_location(Coordinates { latitude, longitude: 11.6 })
}

pub fn test_config(arrays: Vec<ArrayConfig>) -> Config {
    Config {
        entry_id: "home".to_string(),
        server: ServerConfig::default(),
        location: LocationConfig {
            latitude: system_location().latitude,
            longitude: system_location().longitude,
            timezone: "UTC".to_string(),
        },
        update_interval_s: 3600,
        weather: WeatherConfig { timeout_s: 5, forecast_days: 2, ..WeatherConfig::default() },
        max_concurrent_fetches: 4,
        mqtt: MqttConfig::default(),
        arrays,
    }
}

pub fn settings(fetch_timeout: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        system_location: system_location(),
        tz: chrono_tz::Tz::UTC,
        horizon_days: 2,
        fetch_timeout,
        max_concurrent_fetches: 4,
    }
}

pub fn coordinator(
    provider: Arc<ScriptedProvider>,
    arrays: Vec<ArrayConfig>,
    fetch_timeout: Duration,
) -> (Arc<UpdateCoordinator>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let coordinator = UpdateCoordinator::new(
        provider,
        ForecastCache::new(),
        settings(fetch_timeout),
        arrays,
        shutdown.clone(),
    );
    (coordinator, shutdown)
}

/// Synthetic clear-sky series starting at today's UTC midnight.
pub fn clear_sky_series(location: Coordinates, days: u8) -> WeatherSeries {
    let now = Utc::now();
    let start: DateTime<Utc> = now.duration_trunc(ChronoDuration::days(1)).unwrap_or(now);

    let samples = (0..i64::from(days) * 24)
        .map(|h| {
            let timestamp = start + ChronoDuration::hours(h);
            let sun = solar_position(location.latitude, location.longitude, timestamp + ChronoDuration::minutes(30));
            let cos_z = sun.cos_zenith.max(0.0);
            WeatherSample {
                timestamp,
                ghi_w_m2: Some(1000.0 * cos_z),
                dni_w_m2: Some(if cos_z > 0.0 { 850.0 } else { 0.0 }),
                dhi_w_m2: Some(150.0 * cos_z),
                cloud_cover_pct: Some(0.0),
                temperature_c: Some(20.0),
                wind_speed_m_s: Some(2.0),
            }
        })
        .collect();

    WeatherSeries { issued_at: now, samples }
}

#[derive(Debug, Clone)]
enum Rule {
    Fail(ForecastError),
    Delay(Duration),
}

/// In-memory [`WeatherProvider`] scripted per location.
///
/// Locations without a rule answer immediately with a clear-sky series.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    rules: Mutex<Vec<(Coordinates, Rule)>>,
    calls: AtomicUsize,
    calls_by_latitude: Mutex<HashMap<String, usize>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, location: Coordinates, rule: Option<Rule>) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|(loc, _)| *loc != location);
        if let Some(rule) = rule {
            rules.push((location, rule));
        }
    }

    pub fn fail_at(&self, latitude: f64, error: ForecastError) {
        self.set(Coordinates { latitude, longitude: 11.6 }, Some(Rule::Fail(error)));
    }

    pub fn delay_at(&self, latitude: f64, delay: Duration) {
        self.set(Coordinates { latitude, longitude: 11.6 }, Some(Rule::Delay(delay)));
    }

    pub fn clear_at(&self, latitude: f64) {
        self.set(Coordinates { latitude, longitude: 11.6 }, None);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_at(&self, latitude: f64) -> usize {
        let calls = self.calls_by_latitude.lock().unwrap();
        calls.get(&latitude.to_string()).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WeatherProvider for ScriptedProvider {
    async fn fetch(&self, location: Coordinates, horizon_days: u8) -> Result<WeatherSeries, ForecastError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_latitude
            .lock()
            .unwrap()
            .entry(location.latitude.to_string())
            .or_default() += 1;

        let rule = {
            let rules = self.rules.lock().unwrap();
            rules.iter().find(|(loc, _)| *loc == location).map(|(_, rule)| rule.clone())
        };
        match rule {
            Some(Rule::Fail(error)) => Err(error),
            Some(Rule::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(clear_sky_series(location, horizon_days))
            }
            None => Ok(clear_sky_series(location, horizon_days)),
        }
    }
}
