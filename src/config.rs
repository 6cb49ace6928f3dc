use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::error::{ConfigError, ForecastError};

pub const DEFAULT_DECLINATION: f64 = 30.0;
pub const DEFAULT_AZIMUTH: f64 = 180.0;
pub const DEFAULT_KWP: f64 = 5.0;
pub const DEFAULT_DAMPING: f64 = 0.0;

pub const DEFAULT_API_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const MAX_FORECAST_DAYS: u8 = 7;

fn default_entry_id() -> String { "default".to_string() }
fn default_port() -> u16 { 8080 }
fn default_update_interval_s() -> u64 { 3600 }
fn default_max_concurrent_fetches() -> usize { 4 }
fn default_timezone() -> String { "UTC".to_string() }
fn default_base_url() -> String { DEFAULT_API_BASE_URL.to_string() }
fn default_timeout_s() -> u64 { 30 }
fn default_forecast_days() -> u8 { MAX_FORECAST_DAYS }
fn default_declination() -> f64 { DEFAULT_DECLINATION }
fn default_azimuth() -> f64 { DEFAULT_AZIMUTH }
fn default_kwp() -> f64 { DEFAULT_KWP }
fn default_damping() -> f64 { DEFAULT_DAMPING }
fn default_mqtt_port() -> u16 { 1883 }
fn default_topic_prefix() -> String { "solar_forecast".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Identifies this configuration entry for the "update forecast" command.
    #[serde(default = "default_entry_id")]
    pub entry_id: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub location: LocationConfig,
    #[serde(default = "default_update_interval_s")]
    pub update_interval_s: u64,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub arrays: Vec<ArrayConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

/// System location. Arrays without their own coordinates use these.
#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone used for "today" and "tomorrow" boundaries.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl LocationConfig {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates { latitude: self.latitude, longitude: self.longitude }
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone '{}'", self.timezone)))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, ToSchema)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn validate(&self) -> Result<(), ForecastError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ForecastError::InvalidConfig(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ForecastError::InvalidConfig(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_forecast_days")]
    pub forecast_days: u8,
    /// Open-Meteo weather model, e.g. `gfs_seamless`. Provider default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

impl WeatherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_s: default_timeout_s(),
            forecast_days: default_forecast_days(),
            model: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: String::new(),
            broker_port: default_mqtt_port(),
            client_id: String::new(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
        }
    }
}

/// One physically distinct solar array. Immutable once loaded: a change produces
/// a new value and invalidates the array's cached forecast.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
pub struct ArrayConfig {
    pub name: String,
    /// Panel tilt from horizontal, degrees.
    #[serde(rename = "declination", default = "default_declination")]
    pub declination_deg: f64,
    /// Compass orientation, degrees (0 = north, 180 = south).
    #[serde(rename = "azimuth", default = "default_azimuth")]
    pub azimuth_deg: f64,
    #[serde(rename = "kwp", default = "default_kwp")]
    pub capacity_kwp: f64,
    /// Fractional system loss applied to theoretical output.
    #[serde(rename = "damping", default = "default_damping")]
    pub damping_factor: f64,
    /// Horizon elevations (degrees) evenly spaced clockwise from north.
    #[serde(rename = "horizon", default)]
    pub horizon_profile: Option<Vec<f64>>,
    /// Overrides the system location for this array.
    #[serde(default)]
    pub location: Option<Coordinates>,
}

#[cfg(test)]
impl ArrayConfig {
    pub fn new(name: impl Into<String>, declination_deg: f64, azimuth_deg: f64, capacity_kwp: f64) -> Self {
        Self {
            name: name.into(),
            declination_deg,
            azimuth_deg,
            capacity_kwp,
            damping_factor: DEFAULT_DAMPING,
            horizon_profile: None,
            location: None,
        }
    }

    pub fn with_damping(mut self, damping_factor: f64) -> Self {
        self.damping_factor = damping_factor;
        self
    }

    pub fn with_location(mut self, location: Coordinates) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_horizon(mut self, horizon: Vec<f64>) -> Self {
        self.horizon_profile = Some(horizon);
        self
    }
}

impl ArrayConfig {
    /// Location used for this array's weather fetch and solar geometry.
    pub fn coordinates(&self, system: &Coordinates) -> Coordinates {
        self.location.unwrap_or(*system)
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        let invalid = |msg: String| Err(ForecastError::InvalidConfig(format!("{}: {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(ForecastError::InvalidConfig("array name must not be empty".to_string()));
        }
        if !(0.0..=90.0).contains(&self.declination_deg) {
            return invalid(format!("declination {} outside [0, 90]", self.declination_deg));
        }
        if !(0.0..360.0).contains(&self.azimuth_deg) {
            return invalid(format!("azimuth {} outside [0, 360)", self.azimuth_deg));
        }
        if !(self.capacity_kwp.is_finite() && self.capacity_kwp > 0.0) {
            return invalid(format!("kwp {} must be > 0", self.capacity_kwp));
        }
        if !(0.0..=1.0).contains(&self.damping_factor) {
            return invalid(format!("damping {} outside [0, 1]", self.damping_factor));
        }
        if let Some(horizon) = &self.horizon_profile {
            if horizon.is_empty() {
                return invalid("horizon profile must not be empty".to_string());
            }
            if let Some(bad) = horizon.iter().find(|h| !(0.0..=90.0).contains(*h)) {
                return invalid(format!("horizon elevation {bad} outside [0, 90]"));
            }
        }
        if let Some(location) = &self.location {
            location
                .validate()
                .map_err(|e| ForecastError::InvalidConfig(format!("{}: {}", self.name, e)))?;
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks are fatal. Per-array range problems are only reported;
    /// such an array keeps failing with `invalid_config` every cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arrays.is_empty() {
            return Err(ConfigError::Invalid("at least one array must be configured".to_string()));
        }

        let mut names = HashSet::new();
        for array in &self.arrays {
            if array.name.trim().is_empty() {
                return Err(ConfigError::Invalid("array name must not be empty".to_string()));
            }
            if !names.insert(array.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate array name '{}'", array.name)));
            }
            if let Err(e) = array.validate() {
                warn!(array = %array.name, error = %e, "array configuration is invalid, it will not be forecast");
            }
        }

        self.location
            .coordinates()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.location.tz()?;

        if !(300..=86_400).contains(&self.update_interval_s) {
            return Err(ConfigError::Invalid(format!(
                "update_interval_s {} outside [300, 86400]",
                self.update_interval_s
            )));
        }
        if !(1..=120).contains(&self.weather.timeout_s) {
            return Err(ConfigError::Invalid(format!(
                "weather.timeout_s {} outside [1, 120]",
                self.weather.timeout_s
            )));
        }
        if !(1..=MAX_FORECAST_DAYS).contains(&self.weather.forecast_days) {
            return Err(ConfigError::Invalid(format!(
                "weather.forecast_days {} outside [1, {}]",
                self.weather.forecast_days, MAX_FORECAST_DAYS
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid("max_concurrent_fetches must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_s)
    }
}
