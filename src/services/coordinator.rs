use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ArrayConfig, Config, Coordinates};
use crate::error::{ConfigError, ForecastError};
use crate::models::forecast::{
    ArrayForecastResult, ArrayRefreshOutcome, ArrayRefreshReport, FailureRecord, RefreshSummary, RefreshTrigger,
};
use crate::services::forecast_cache::{CacheSnapshot, ForecastCache, PutOutcome};
use crate::services::solar_algorithm;
use crate::services::weather_client::WeatherProvider;

type SummarySlot = Option<Arc<RefreshSummary>>;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub system_location: Coordinates,
    /// Timezone of the "today"/"tomorrow" boundaries.
    pub tz: Tz,
    pub horizon_days: u8,
    /// Deadline of one weather fetch.
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            system_location: config.location.coordinates(),
            tz: config.location.tz()?,
            horizon_days: config.weather.forecast_days,
            fetch_timeout: config.weather.timeout(),
            max_concurrent_fetches: config.max_concurrent_fetches,
        })
    }
}

/// Configured arrays tagged with the configuration generation they belong to.
#[derive(Debug)]
struct ArraySet {
    generation: u64,
    arrays: Arc<Vec<ArrayConfig>>,
}

#[derive(Debug)]
struct InFlight {
    cycle_id: Uuid,
    done: watch::Receiver<SummarySlot>,
    cancel: CancellationToken,
}

impl InFlight {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.done.borrow().is_none() && self.done.has_changed().is_ok()
    }
}

/// Pending result of a refresh cycle that was started or joined.
pub struct RefreshHandle {
    pub cycle_id: Uuid,
    done: watch::Receiver<SummarySlot>,
}

impl RefreshHandle {
    pub async fn wait(mut self) -> Result<Arc<RefreshSummary>, ForecastError> {
        let slot = self.done.wait_for(Option::is_some).await.map_err(|_| ForecastError::Cancelled)?;
        (*slot).clone().ok_or(ForecastError::Cancelled)
    }
}

/// Drives refresh cycles and owns the writes into the forecast cache.
///
/// At most one cycle runs per configuration: a refresh requested while a cycle
/// is in flight joins that cycle and receives its summary.
pub struct UpdateCoordinator {
    provider: Arc<dyn WeatherProvider>,
    cache: ForecastCache,
    settings: CoordinatorSettings,
    arrays: RwLock<ArraySet>,
    in_flight: Mutex<Option<InFlight>>,
    summaries: watch::Sender<SummarySlot>,
    shutdown: CancellationToken,
}

impl UpdateCoordinator {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        cache: ForecastCache,
        settings: CoordinatorSettings,
        arrays: Vec<ArrayConfig>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (summaries, _) = watch::channel(None);
        Arc::new(Self {
            provider,
            cache,
            settings,
            arrays: RwLock::new(ArraySet { generation: 0, arrays: Arc::new(arrays) }),
            in_flight: Mutex::new(None),
            summaries,
            shutdown,
        })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ForecastCache {
        &self.cache
    }

    pub fn arrays(&self) -> Arc<Vec<ArrayConfig>> {
        Arc::clone(&self.arrays.read().unwrap_or_else(PoisonError::into_inner).arrays)
    }

    /// Arrays and cache contents observed together, so a reconfiguration cannot
    /// fall between the two reads.
    pub fn read_view(&self) -> (Arc<Vec<ArrayConfig>>, CacheSnapshot) {
        let set = self.arrays.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&set.arrays), self.cache.snapshot())
    }

    pub fn last_summary(&self) -> Option<Arc<RefreshSummary>> {
        self.summaries.borrow().clone()
    }

    /// Notified with every completed cycle summary.
    pub fn subscribe(&self) -> watch::Receiver<SummarySlot> {
        self.summaries.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(InFlight::is_running)
    }

    /// Refreshes every configured array and returns the cycle summary.
    ///
    /// Per-array failures are reported in the summary, never as an error. The
    /// only error is `Cancelled`, when the cycle task ended without a summary.
    pub async fn refresh_all(self: &Arc<Self>, trigger: RefreshTrigger) -> Result<Arc<RefreshSummary>, ForecastError> {
        self.begin_refresh(trigger).wait().await
    }

    /// Starts a cycle, or joins the one in flight, without waiting for it.
    pub fn begin_refresh(self: &Arc<Self>, trigger: RefreshTrigger) -> RefreshHandle {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = slot.as_ref().filter(|f| f.is_running()) {
            debug!(cycle_id = %running.cycle_id, ?trigger, "joining in-flight refresh cycle");
            return RefreshHandle { cycle_id: running.cycle_id, done: running.done.clone() };
        }

        let cycle_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let (tx, rx) = watch::channel(None);
        *slot = Some(InFlight { cycle_id, done: rx.clone(), cancel: cancel.clone() });
        drop(slot);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let summary = Arc::new(this.run_cycle(cycle_id, trigger, cancel).await);
            this.summaries.send_replace(Some(Arc::clone(&summary)));
            let _ = tx.send(Some(summary));
        });

        RefreshHandle { cycle_id, done: rx }
    }

    /// Spawns the scheduler. Cycles are awaited one after another, so scheduled
    /// cycles never overlap.
    pub fn start(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_s = interval.as_secs(), "forecast scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.refresh_all(RefreshTrigger::Scheduled).await {
                            warn!("scheduled refresh ended without summary: {err}");
                        }
                    }
                }
            }
            info!("forecast scheduler stopped");
        })
    }

    /// Replaces the configured arrays.
    ///
    /// Cached forecasts of removed arrays and of arrays whose configuration
    /// changed are dropped. A cycle in flight is cancelled and can no longer
    /// write into the cache.
    pub fn reconfigure(&self, arrays: Vec<ArrayConfig>) -> Result<(), ForecastError> {
        if arrays.is_empty() {
            return Err(ForecastError::InvalidConfig("at least one array must be configured".to_string()));
        }
        let mut names = HashSet::new();
        for array in &arrays {
            if array.name.trim().is_empty() {
                return Err(ForecastError::InvalidConfig("array name must not be empty".to_string()));
            }
            if !names.insert(array.name.as_str()) {
                return Err(ForecastError::InvalidConfig(format!("duplicate array name '{}'", array.name)));
            }
        }

        // Lock order: `in_flight` before `arrays`. Holding both means no refresh
        // can join the old cycle or start between the swap and the cancel.
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut set = self.arrays.write().unwrap_or_else(PoisonError::into_inner);
        let previous = Arc::clone(&set.arrays);
        self.cache.retain(|name| {
            let old = previous.iter().find(|a| a.name == name);
            let new = arrays.iter().find(|a| a.name == name);
            matches!((old, new), (Some(old), Some(new)) if old == new)
        });
        set.generation += 1;
        set.arrays = Arc::new(arrays);
        if let Some(running) = in_flight.take() {
            running.cancel.cancel();
        }
        info!(generation = set.generation, arrays = set.arrays.len(), "array configuration replaced");
        Ok(())
    }

    async fn run_cycle(&self, cycle_id: Uuid, trigger: RefreshTrigger, cancel: CancellationToken) -> RefreshSummary {
        let started_at = Utc::now();
        let (generation, arrays) = {
            let set = self.arrays.read().unwrap_or_else(PoisonError::into_inner);
            (set.generation, Arc::clone(&set.arrays))
        };
        info!(%cycle_id, ?trigger, arrays = arrays.len(), "refresh cycle started");

        let mut indexed: Vec<(usize, ArrayRefreshReport)> = stream::iter(arrays.iter().cloned().enumerate())
            .map(|(index, config)| {
                let cancel = cancel.clone();
                async move { (index, self.refresh_array(cycle_id, generation, config, cancel).await) }
            })
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let summary = RefreshSummary {
            cycle_id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            reports: indexed.into_iter().map(|(_, report)| report).collect(),
        };

        let elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds();
        if summary.total_failure() {
            error!(%cycle_id, elapsed_ms, "refresh cycle failed for every array and no forecast is available");
        } else {
            info!(
                %cycle_id,
                succeeded = summary.succeeded(),
                failed = summary.failed(),
                cached = self.cache.len(),
                elapsed_ms,
                "refresh cycle finished"
            );
        }
        summary
    }

    async fn refresh_array(
        &self,
        cycle_id: Uuid,
        generation: u64,
        config: ArrayConfig,
        cancel: CancellationToken,
    ) -> ArrayRefreshReport {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ArrayRefreshOutcome::Cancelled,
            result = self.fetch_and_estimate(&config) => self.record(generation, &config.name, result),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            ArrayRefreshOutcome::Updated { points, .. } => {
                debug!(%cycle_id, array = %config.name, points, duration_ms, "array forecast updated");
            }
            ArrayRefreshOutcome::Superseded { .. } => {
                debug!(%cycle_id, array = %config.name, "newer forecast already cached");
            }
            ArrayRefreshOutcome::Failed { kind, message, stale_data_retained } => {
                warn!(
                    %cycle_id,
                    array = %config.name,
                    error_kind = ?kind,
                    stale_data_retained,
                    duration_ms,
                    "array refresh failed: {message}"
                );
            }
            ArrayRefreshOutcome::Cancelled => {
                debug!(%cycle_id, array = %config.name, "array refresh cancelled");
            }
        }

        ArrayRefreshReport { array_name: config.name, outcome, duration_ms }
    }

    async fn fetch_and_estimate(&self, config: &ArrayConfig) -> Result<ArrayForecastResult, ForecastError> {
        config.validate()?;
        let location = config.coordinates(&self.settings.system_location);

        let fetch = self.provider.fetch(location, self.settings.horizon_days);
        let series = tokio::time::timeout(self.settings.fetch_timeout, fetch)
            .await
            .map_err(|_| ForecastError::Timeout { timeout_secs: self.settings.fetch_timeout.as_secs() })??;

        solar_algorithm::estimate(config, &location, &series, Utc::now())
    }

    /// Writes one array's outcome into the cache unless the configuration it was
    /// computed for has been replaced in the meantime.
    fn record(
        &self,
        generation: u64,
        name: &str,
        result: Result<ArrayForecastResult, ForecastError>,
    ) -> ArrayRefreshOutcome {
        // The read guard keeps `reconfigure` out until the write is done.
        let set = self.arrays.read().unwrap_or_else(PoisonError::into_inner);
        if set.generation != generation {
            return ArrayRefreshOutcome::Cancelled;
        }

        match result {
            Ok(forecast) => {
                let computed_at = forecast.computed_at;
                let points = forecast.points.len();
                match self.cache.put(name, forecast) {
                    PutOutcome::Stored => ArrayRefreshOutcome::Updated { computed_at, points },
                    PutOutcome::Superseded => ArrayRefreshOutcome::Superseded { computed_at },
                }
            }
            Err(err) => {
                let failure = FailureRecord { at: Utc::now(), kind: err.kind(), message: err.to_string() };
                let stale_data_retained = self.cache.mark_failed(name, failure);
                ArrayRefreshOutcome::Failed { kind: err.kind(), message: err.to_string(), stale_data_retained }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{array_at, coordinator, ScriptedProvider};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn three_arrays() -> Vec<ArrayConfig> {
        vec![array_at("A", 40.0), array_at("B", 41.0), array_at("C", 42.0)]
    }

    fn outcome<'a>(summary: &'a RefreshSummary, name: &str) -> &'a ArrayRefreshOutcome {
        &summary.report(name).unwrap().outcome
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_array() {
        let provider = ScriptedProvider::new();
        provider.fail_at(41.0, ForecastError::Network("connection reset".into()));
        let (coordinator, _shutdown) = coordinator(provider.clone(), three_arrays(), TIMEOUT);

        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();

        assert_eq!(summary.reports.len(), 3);
        assert_eq!(summary.reports[1].array_name, "B");
        assert!(matches!(outcome(&summary, "A"), ArrayRefreshOutcome::Updated { .. }));
        assert!(matches!(outcome(&summary, "C"), ArrayRefreshOutcome::Updated { .. }));
        assert!(matches!(
            outcome(&summary, "B"),
            ArrayRefreshOutcome::Failed { kind: ErrorKind::Network, stale_data_retained: false, .. }
        ));
        assert!(!summary.total_failure());

        let cache = coordinator.cache();
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert!(cache.get("B").is_none());
        assert_eq!(cache.last_failure("B").map(|f| f.kind), Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_failure_retains_previous_forecast() {
        let provider = ScriptedProvider::new();
        let (coordinator, _shutdown) = coordinator(provider.clone(), three_arrays(), TIMEOUT);

        coordinator.refresh_all(RefreshTrigger::Startup).await.unwrap();
        let before = coordinator.cache().get("B").unwrap();

        provider.fail_at(41.0, ForecastError::RateLimit("HTTP 429".into()));
        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();

        assert!(matches!(
            outcome(&summary, "B"),
            ArrayRefreshOutcome::Failed { kind: ErrorKind::RateLimit, stale_data_retained: true, .. }
        ));
        let after = coordinator.cache().get("B").unwrap();
        assert_eq!(after.result, before.result);
        assert!(after.is_stale());

        let a = coordinator.cache().get("A").unwrap();
        assert!(a.result.computed_at >= before.result.computed_at);
        assert!(!a.is_stale());
    }

    #[tokio::test]
    async fn test_every_array_failing_still_returns_summary() {
        let provider = ScriptedProvider::new();
        for lat in [40.0, 41.0, 42.0] {
            provider.fail_at(lat, ForecastError::MalformedResponse("bad json".into()));
        }
        let (coordinator, _shutdown) = coordinator(provider, three_arrays(), TIMEOUT);

        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();

        assert_eq!(summary.failed(), 3);
        assert!(summary.total_failure());
        assert_eq!(coordinator.cache().len(), 0);
        assert_eq!(coordinator.last_summary().unwrap().cycle_id, summary.cycle_id);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_cycle() {
        let provider = ScriptedProvider::new();
        for lat in [40.0, 41.0, 42.0] {
            provider.delay_at(lat, Duration::from_millis(200));
        }
        let (coordinator, _shutdown) = coordinator(provider.clone(), three_arrays(), TIMEOUT);

        let (first, second, third) = tokio::join!(
            coordinator.refresh_all(RefreshTrigger::Scheduled),
            coordinator.refresh_all(RefreshTrigger::Manual),
            coordinator.refresh_all(RefreshTrigger::Manual),
        );

        let first = first.unwrap();
        assert_eq!(first.cycle_id, second.unwrap().cycle_id);
        assert_eq!(first.cycle_id, third.unwrap().cycle_id);
        assert_eq!(first.trigger, RefreshTrigger::Scheduled);
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.calls_at(41.0), 1);
        assert!(!coordinator.is_refreshing());

        let next = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();
        assert_ne!(next.cycle_id, first.cycle_id);
        assert_eq!(provider.calls(), 6);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out_without_delaying_others() {
        let provider = ScriptedProvider::new();
        provider.delay_at(42.0, Duration::from_secs(10));
        let (coordinator, _shutdown) = coordinator(provider, three_arrays(), Duration::from_millis(100));

        let started = Instant::now();
        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            outcome(&summary, "C"),
            ArrayRefreshOutcome::Failed { kind: ErrorKind::Timeout, .. }
        ));
        assert_eq!(summary.succeeded(), 2);
    }

    #[tokio::test]
    async fn test_invalid_array_fails_without_fetching() {
        let provider = ScriptedProvider::new();
        let mut arrays = three_arrays();
        arrays[0].declination_deg = 120.0;
        let (coordinator, _shutdown) = coordinator(provider.clone(), arrays, TIMEOUT);

        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();

        assert!(matches!(
            outcome(&summary, "A"),
            ArrayRefreshOutcome::Failed { kind: ErrorKind::InvalidConfig, .. }
        ));
        assert_eq!(provider.calls_at(40.0), 0);
        assert_eq!(summary.succeeded(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_cycle() {
        let provider = ScriptedProvider::new();
        for lat in [40.0, 41.0, 42.0] {
            provider.delay_at(lat, Duration::from_secs(3));
        }
        let (coordinator, shutdown) = coordinator(provider, three_arrays(), TIMEOUT);

        let handle = coordinator.begin_refresh(RefreshTrigger::Manual);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let summary = handle.wait().await.unwrap();

        assert!(summary.reports.iter().all(|r| r.outcome == ArrayRefreshOutcome::Cancelled));
        assert_eq!(coordinator.cache().len(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_prunes_cache_and_cancels_cycle() {
        let provider = ScriptedProvider::new();
        let (coordinator, _shutdown) = coordinator(provider.clone(), three_arrays(), TIMEOUT);
        coordinator.refresh_all(RefreshTrigger::Startup).await.unwrap();
        assert_eq!(coordinator.cache().len(), 3);

        provider.delay_at(42.0, Duration::from_secs(3));
        let handle = coordinator.begin_refresh(RefreshTrigger::Manual);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut changed = array_at("A", 40.0);
        changed.capacity_kwp = 8.0;
        coordinator
            .reconfigure(vec![changed, array_at("C", 42.0), array_at("D", 43.0)])
            .unwrap();

        let stale_cycle = handle.wait().await.unwrap();
        assert_eq!(*outcome(&stale_cycle, "C"), ArrayRefreshOutcome::Cancelled);

        let cache = coordinator.cache();
        assert!(cache.get("A").is_none(), "changed array is invalidated");
        assert!(cache.get("B").is_none(), "removed array is invalidated");
        assert!(cache.get("C").is_some(), "unchanged array keeps its forecast");

        provider.clear_at(42.0);
        let summary = coordinator.refresh_all(RefreshTrigger::Reconfigure).await.unwrap();
        let names: Vec<_> = summary.reports.iter().map(|r| r.array_name.as_str()).collect();
        assert_eq!(names, ["A", "C", "D"]);
        assert_eq!(coordinator.cache().get("A").unwrap().result.points.len(), 48);
    }

    #[tokio::test]
    async fn test_refresh_after_reconfigure_starts_new_cycle() {
        let provider = ScriptedProvider::new();
        provider.delay_at(41.0, Duration::from_secs(3));
        let (coordinator, _shutdown) = coordinator(provider.clone(), three_arrays(), TIMEOUT);
        let old = coordinator.begin_refresh(RefreshTrigger::Scheduled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_refreshing());

        coordinator.reconfigure(vec![array_at("A", 40.0), array_at("D", 43.0)]).unwrap();
        assert!(!coordinator.is_refreshing());

        let next = coordinator.begin_refresh(RefreshTrigger::Scheduled);
        assert_ne!(next.cycle_id, old.cycle_id);
        let summary = next.wait().await.unwrap();
        let names: Vec<_> = summary.reports.iter().map(|r| r.array_name.as_str()).collect();
        assert_eq!(names, ["A", "D"]);
        assert!(summary.reports.iter().all(|r| r.is_success()));
        assert!(old.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_duplicate_names() {
        let (coordinator, _shutdown) = coordinator(ScriptedProvider::new(), three_arrays(), TIMEOUT);
        let err = coordinator.reconfigure(vec![array_at("A", 1.0), array_at("A", 2.0)]).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidConfig(_)));
        assert_eq!(coordinator.arrays().len(), 3);
    }

    #[tokio::test]
    async fn test_subscribers_see_completed_cycles() {
        let (coordinator, _shutdown) = coordinator(ScriptedProvider::new(), three_arrays(), TIMEOUT);
        let mut rx = coordinator.subscribe();

        let summary = coordinator.refresh_all(RefreshTrigger::Manual).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().cycle_id, summary.cycle_id);
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let (coordinator, _shutdown) = coordinator(ScriptedProvider::new(), three_arrays(), TIMEOUT);
        let cancel = CancellationToken::new();
        let task = coordinator.start(Duration::from_millis(50), cancel.clone());

        let mut rx = coordinator.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().trigger, RefreshTrigger::Scheduled);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
