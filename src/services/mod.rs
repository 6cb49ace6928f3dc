pub mod aggregator;
pub mod coordinator;
pub mod forecast_cache;
pub mod forecast_service;
pub mod mqtt_service;
pub mod solar_algorithm;
pub mod weather_client;
