use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt as _;
use infrastructure::meter;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use super::{DataSource, EngineState, Health, OfflineReason, PollError, RetryPolicy, SensorReading, SourceConfig};

type UpdateCallback<R> = Arc<dyn Fn(&R) + Send + Sync>;

pub struct Poller<S: DataSource> {
    name: String,
    source: Arc<S>,
    retry_policy: RetryPolicy,
    state: Arc<watch::Sender<EngineState<S::Reading>>>,
    running: Mutex<Option<CancellationToken>>,
}

impl<S: DataSource> Poller<S> {
    pub fn new(name: impl Into<String>, source: S, retry_policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(EngineState::default());

        Self {
            name: name.into(),
            source: Arc::new(source),
            retry_policy,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Validates `config` and schedules the first cycle right away. A no-op while already running.
    pub async fn start<F>(&self, config: SourceConfig, on_update: F) -> Result<(), PollError>
    where
        F: Fn(&S::Reading) + Send + Sync + 'static,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Poller {} is already running", self.name);
            return Ok(());
        }

        if let Err(e) = config.validate() {
            tracing::warn!("Not starting poller {}: {}", self.name, e);
            self.state
                .send_modify(|s| *s = EngineState::new_run(s.run + 1, Health::offline(&e)));
            return Err(e);
        }

        let mut run = 0;
        self.state.send_modify(|s| {
            run = s.run + 1;
            *s = EngineState::new_run(run, Health::Online { detail: None });
        });

        tracing::info!(
            "Starting poller {} for {} every {} seconds",
            self.name,
            config.url,
            config.refresh_seconds
        );

        let cancel = CancellationToken::new();
        let poll_loop = PollLoop {
            name: self.name.clone(),
            run,
            config,
            retry_policy: self.retry_policy,
            source: self.source.clone(),
            state: self.state.clone(),
            on_update: Arc::new(on_update),
            cancel: cancel.clone(),
        };

        tokio::spawn(poll_loop.run());
        *running = Some(cancel);

        Ok(())
    }

    /// Prevents any further cycle. A cycle already in flight runs to completion.
    pub async fn stop(&self) {
        if let Some(cancel) = self.running.lock().await.take() {
            tracing::info!("Stopping poller {}", self.name);
            cancel.cancel();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn state(&self) -> EngineState<S::Reading> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState<S::Reading>> {
        self.state.subscribe()
    }
}

impl<S: DataSource> Drop for Poller<S> {
    fn drop(&mut self) {
        if let Some(cancel) = self.running.get_mut().take() {
            cancel.cancel();
        }
    }
}

struct PollLoop<S: DataSource> {
    name: String,
    run: u64,
    config: SourceConfig,
    retry_policy: RetryPolicy,
    source: Arc<S>,
    state: Arc<watch::Sender<EngineState<S::Reading>>>,
    on_update: UpdateCallback<S::Reading>,
    cancel: CancellationToken,
}

impl<S: DataSource> PollLoop<S> {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let span = tracing::info_span!("poll_cycle", sensor = %self.name);
            let cycle = AssertUnwindSafe(self.cycle()).catch_unwind().instrument(span);

            if let Err(panic) = cycle.await {
                tracing::error!("Poll cycle of {} panicked: {}", self.name, panic_message(panic.as_ref()));
                self.record("panic", 0);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {},
                _ = tokio::time::sleep(self.config.interval()) => {},
            }
        }

        tracing::debug!("Poller {} stopped", self.name);
    }

    async fn cycle(&self) {
        self.update(|s| s.retries = 0);

        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut backoff = self.retry_policy.backoff();

        loop {
            let result = self
                .source
                .fetch(&self.config)
                .await
                .and_then(|reading| reading.check().map(|_| reading));

            match result {
                Ok(reading) => {
                    self.publish(reading);
                    self.record("success", backoff.attempts());
                    return;
                }

                Err(e) if e.is_retryable() && backoff.attempts() + 1 < max_attempts => {
                    let delay = backoff.next_delay();
                    backoff.bump();

                    let retries = backoff.attempts();
                    tracing::warn!(
                        "{} Retrying {} in {:?} ({}/{})",
                        e,
                        self.name,
                        delay,
                        retries,
                        max_attempts - 1
                    );
                    self.update(|s| s.retries = retries);

                    tokio::time::sleep(delay).await;
                }

                Err(e) => {
                    self.report_failure(&e, backoff.attempts() + 1);
                    self.record(e.kind(), backoff.attempts());
                    return;
                }
            }
        }
    }

    fn publish(&self, reading: S::Reading) {
        let reading = Arc::new(reading);
        let detail = reading.status_detail();

        let published = self.update(|s| {
            s.reading = Some(reading.clone());
            s.health = Health::Online { detail: Some(detail) };
            s.last_success = Some(Utc::now());
        });

        if published {
            tracing::debug!("Poller {} received {:?}", self.name, reading);
            (self.on_update)(&*reading);
        }
    }

    fn report_failure(&self, error: &PollError, attempts: u32) {
        let health = match error {
            PollError::SentinelReading { .. } => Health::Offline {
                reason: OfflineReason::SensorMalfunction,
                detail: format!("{} Gave up after {} attempts", error, attempts),
            },
            _ => Health::offline(error),
        };

        tracing::warn!("Poller {} is {}", self.name, health);
        self.update(|s| s.health = health);
    }

    //outcomes of a replaced run must not leak into the new one
    fn update(&self, modify: impl FnOnce(&mut EngineState<S::Reading>)) -> bool {
        let applied = self.state.send_if_modified(|s| {
            if s.run != self.run {
                return false;
            }

            modify(s);
            true
        });

        if !applied {
            tracing::debug!("Poller {} was restarted, discarding outcome of previous run", self.name);
        }

        applied
    }

    fn record(&self, outcome: &str, retries: u32) {
        meter::increment("poll_cycles_total", &[("sensor", self.name.as_str()), ("outcome", outcome)]);
        meter::set("poll_cycle_retries", retries as f64, &[("sensor", self.name.as_str())]);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestReading {
        humidity: i16,
    }

    impl SensorReading for TestReading {
        fn check(&self) -> Result<(), PollError> {
            if self.humidity > 0 {
                Ok(())
            } else {
                Err(PollError::SentinelReading {
                    humidity: self.humidity,
                })
            }
        }

        fn status_detail(&self) -> String {
            format!("Humidity: {}", self.humidity)
        }
    }

    enum Step {
        Reading(i16),
        Slow(Duration, i16),
        Fail(PollError),
        Panic,
    }

    //once the script is used up every fetch returns a plausible reading of 50
    #[derive(Clone, Default)]
    struct ScriptedSource {
        steps: Arc<StdMutex<VecDeque<Step>>>,
        fetches: Arc<StdMutex<Vec<Instant>>>,
    }

    impl ScriptedSource {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                steps: Arc::new(StdMutex::new(steps.into_iter().collect())),
                fetches: Arc::default(),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }

        fn fetch_times(&self) -> Vec<Instant> {
            self.fetches.lock().unwrap().clone()
        }
    }

    impl DataSource for ScriptedSource {
        type Reading = TestReading;

        async fn fetch(&self, _config: &SourceConfig) -> Result<TestReading, PollError> {
            self.fetches.lock().unwrap().push(Instant::now());
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Reading(50));

            match step {
                Step::Reading(humidity) => Ok(TestReading { humidity }),
                Step::Slow(duration, humidity) => {
                    tokio::time::sleep(duration).await;
                    Ok(TestReading { humidity })
                }
                Step::Fail(e) => Err(e),
                Step::Panic => panic!("sensor driver crashed"),
            }
        }
    }

    type Updates = Arc<StdMutex<Vec<TestReading>>>;

    fn recorder() -> (Updates, impl Fn(&TestReading) + Send + Sync + 'static) {
        let updates: Updates = Arc::default();
        let sink = updates.clone();
        (updates, move |reading: &TestReading| sink.lock().unwrap().push(reading.clone()))
    }

    fn config() -> SourceConfig {
        SourceConfig::new("http://sensor.local", Some(5))
    }

    fn fast_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_goes_online_and_fetches_immediately() {
        let source = ScriptedSource::new([Step::Reading(45)]);
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());
        let (updates, on_update) = recorder();

        poller.start(config(), on_update).await.unwrap();
        assert!(poller.state().health.is_online());
        assert!(poller.is_running().await);

        settle().await;

        let state = poller.state();
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(state.reading.as_deref(), Some(&TestReading { humidity: 45 }));
        assert_eq!(
            state.health,
            Health::Online {
                detail: Some("Humidity: 45".to_string())
            }
        );
        assert!(state.last_success.is_some());
        assert_eq!(*updates.lock().unwrap(), vec![TestReading { humidity: 45 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn next_cycle_starts_interval_after_previous_completed() {
        let source = ScriptedSource::new([Step::Slow(Duration::from_secs(2), 45)]);
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());

        poller.start(config(), |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;

        let times = source.fetch_times();
        assert_eq!(times.len(), 2);

        let gap = times[1] - times[0];
        assert!(gap >= Duration::from_secs(7), "gap was {:?}", gap);
        assert!(gap < Duration::from_millis(7_010), "gap was {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_keeps_a_single_timer() {
        let source = ScriptedSource::default();
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());

        poller.start(config(), |_| {}).await.unwrap();
        poller.start(config(), |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        //cycles at 0s, 5s and 10s
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_cycles() {
        let source = ScriptedSource::default();
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());

        poller.start(config(), |_| {}).await.unwrap();
        settle().await;
        assert_eq!(source.fetch_count(), 1);

        poller.stop().await;
        poller.stop().await;
        assert!(!poller.is_running().await);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_goes_offline_and_keeps_previous_reading() {
        let source = ScriptedSource::new([
            Step::Reading(45),
            Step::Fail(PollError::transport("connection timed out")),
        ]);
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());
        let (updates, on_update) = recorder();

        poller.start(config(), on_update).await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = poller.state();
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(
            state.health,
            Health::Offline {
                reason: OfflineReason::CommunicationError,
                detail: "connection timed out".to_string()
            }
        );
        assert_eq!(state.reading.as_deref(), Some(&TestReading { humidity: 45 }));
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_is_not_retried_within_cycle() {
        let source = ScriptedSource::new([Step::Fail(PollError::decode("expected value"))]);
        let poller = Poller::new("test", source.clone(), fast_retries(5));

        poller.start(config(), |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(source.fetch_count(), 1);
        assert!(matches!(
            poller.state().health,
            Health::Offline {
                reason: OfflineReason::CommunicationError,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_reading_is_refetched_before_next_interval() {
        let source = ScriptedSource::new([Step::Reading(0), Step::Reading(45)]);
        let poller = Poller::new("test", source.clone(), fast_retries(5));
        let (updates, on_update) = recorder();

        poller.start(config(), on_update).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let times = source.fetch_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] < config().interval());

        let state = poller.state();
        assert_eq!(state.retries, 1);
        assert!(state.health.is_online());
        assert_eq!(*updates.lock().unwrap(), vec![TestReading { humidity: 45 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_retries_are_bounded() {
        let source = ScriptedSource::new([Step::Reading(0), Step::Reading(-1), Step::Reading(0)]);
        let poller = Poller::new("test", source.clone(), fast_retries(3));
        let (updates, on_update) = recorder();

        poller.start(config(), on_update).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let state = poller.state();
        assert_eq!(source.fetch_count(), 3);
        assert_eq!(state.retries, 2);
        assert!(state.reading.is_none());
        assert!(matches!(
            state.health,
            Health::Offline {
                reason: OfflineReason::SensorMalfunction,
                ..
            }
        ));
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_counter_is_reset_by_next_cycle() {
        let source = ScriptedSource::new([Step::Reading(0), Step::Reading(45)]);
        let poller = Poller::new("test", source.clone(), fast_retries(5));

        poller.start(config(), |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(poller.state().retries, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.fetch_count(), 3);
        assert_eq!(poller.state().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_url_fails_start_without_scheduling() {
        let source = ScriptedSource::default();
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());

        let result = poller.start(SourceConfig::new("", Some(5)), |_| {}).await;

        assert!(matches!(result, Err(PollError::Config { .. })));
        assert!(matches!(
            poller.state().health,
            Health::Offline {
                reason: OfflineReason::ConfigurationError,
                ..
            }
        ));
        assert!(!poller.is_running().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_cycle_does_not_stop_the_timer() {
        let source = ScriptedSource::new([Step::Panic, Step::Reading(45)]);
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());

        poller.start(config(), |_| {}).await.unwrap();
        settle().await;
        assert_eq!(source.fetch_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(poller.state().reading.as_deref(), Some(&TestReading { humidity: 45 }));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_reading_and_ignores_previous_run() {
        let source = ScriptedSource::new([Step::Slow(Duration::from_secs(2), 45)]);
        let poller = Poller::new("test", source.clone(), RetryPolicy::default());
        let (first_updates, first_on_update) = recorder();
        let (second_updates, second_on_update) = recorder();

        poller.start(config(), first_on_update).await.unwrap();
        settle().await;
        poller.stop().await;

        poller.start(config(), second_on_update).await.unwrap();
        assert!(poller.state().reading.is_none());

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(first_updates.lock().unwrap().is_empty());
        assert_eq!(*second_updates.lock().unwrap(), vec![TestReading { humidity: 50 }]);
        assert_eq!(poller.state().reading.as_deref(), Some(&TestReading { humidity: 50 }));
    }

    #[test]
    fn panic_message_from_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
