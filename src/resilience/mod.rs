//! Circuit breaker isolating the gateway from a failing downstream platform.

use crate::config::BreakerConfig;
use crate::errors::{GatewayError, GatewayResult};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls flow through and are recorded.
    Closed,
    /// Failing fast; calls are rejected without invoking the action.
    Open,
    /// Testing recovery with a single trial probe.
    HalfOpen,
}

/// Observable state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// The circuit opened.
    Opened,
    /// The circuit moved from open to half-open.
    HalfOpened,
    /// The circuit closed after a successful probe.
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    successes: u32,
    failures: u32,
}

/// Rolling statistics window divided into fixed-duration buckets. Buckets
/// older than the window span rotate out as time advances.
struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_duration: Duration,
    current: usize,
    last_rotation: Instant,
}

impl RollingWindow {
    fn new(span: Duration, bucket_count: u32, now: Instant) -> Self {
        let count = bucket_count.max(1) as usize;
        Self {
            buckets: vec![Bucket::default(); count],
            bucket_duration: span / count as u32,
            current: 0,
            last_rotation: now,
        }
    }

    fn rotate(&mut self, now: Instant) {
        if self.bucket_duration.is_zero() {
            return;
        }
        let elapsed = now.duration_since(self.last_rotation);
        let steps = (elapsed.as_nanos() / self.bucket_duration.as_nanos()) as u64;
        if steps == 0 {
            return;
        }

        if steps as usize >= self.buckets.len() {
            // The whole window has aged out.
            self.clear(now);
            return;
        }

        for _ in 0..steps {
            self.current = (self.current + 1) % self.buckets.len();
            self.buckets[self.current] = Bucket::default();
        }
        self.last_rotation += self.bucket_duration * steps as u32;
    }

    fn record_success(&mut self, now: Instant) {
        self.rotate(now);
        self.buckets[self.current].successes += 1;
    }

    fn record_failure(&mut self, now: Instant) {
        self.rotate(now);
        self.buckets[self.current].failures += 1;
    }

    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.rotate(now);
        self.buckets.iter().fold((0, 0), |(s, f), bucket| {
            (s + bucket.successes, f + bucket.failures)
        })
    }

    fn clear(&mut self, now: Instant) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        self.current = 0;
        self.last_rotation = now;
    }
}

struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    window: RollingWindow,
}

/// Circuit breaker wrapping one protected call-site.
///
/// Created once per call-site and shared for the process lifetime; the type
/// parameter is the wrapped action's result. Concurrent calls during
/// half-open are serialized to a single in-flight probe; the rest are
/// rejected as if the circuit were still open until the probe resolves.
pub struct CircuitBreaker<R> {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerEvent>,
    fallback: Option<Arc<dyn Fn(&GatewayError) -> GatewayResult<R> + Send + Sync>>,
}

impl<R> CircuitBreaker<R> {
    /// Creates a breaker in the closed state.
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        let window = RollingWindow::new(
            config.rolling_count_timeout,
            config.rolling_count_buckets,
            now,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                probe_in_flight: false,
                window,
            }),
            events,
            fallback: None,
        }
    }

    /// Registers a fallback producing a substitute result instead of
    /// propagating the open-circuit rejection.
    pub fn with_fallback(
        mut self,
        fallback: impl Fn(&GatewayError) -> GatewayResult<R> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Subscribes to state transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Gets the current circuit state, applying the open-to-half-open
    /// transition when the reset timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Invokes the wrapped action through the breaker state machine.
    ///
    /// The action is bounded by the configured timeout; exceeding it counts
    /// as a failure. While the circuit is open the action is never invoked
    /// and the call rejects with the distinct circuit-open error (or the
    /// registered fallback result).
    pub async fn fire<F, Fut>(&self, action: F) -> GatewayResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<R>>,
    {
        let is_probe = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            self.refresh(&mut inner, now);

            match inner.state {
                CircuitState::Open => {
                    drop(inner);
                    return self.reject_open();
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        // Exactly one probe at a time; everyone else is
                        // rejected as if still open.
                        drop(inner);
                        return self.reject_open();
                    }
                    inner.probe_in_flight = true;
                    true
                }
                CircuitState::Closed => false,
            }
        };

        let result = match tokio::time::timeout(self.config.timeout, action()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(self.config.timeout)),
        };

        match result {
            Ok(value) => {
                self.record_success(is_probe);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(is_probe);
                Err(error)
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now.duration_since(opened_at) >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                    let _ = self.events.send(BreakerEvent::HalfOpened);
                    tracing::info!("Circuit breaker transitioning to half-open");
                }
            }
        }
    }

    fn reject_open(&self) -> GatewayResult<R> {
        let error = GatewayError::circuit_open();
        match &self.fallback {
            Some(fallback) => fallback(&error),
            None => Err(error),
        }
    }

    fn record_success(&self, is_probe: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if is_probe {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            inner.window.clear(now);
            let _ = self.events.send(BreakerEvent::Closed);
            tracing::info!("Circuit breaker closed after successful probe");
        } else if inner.state == CircuitState::Closed {
            inner.window.record_success(now);
        }
    }

    fn record_failure(&self, is_probe: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if is_probe {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            let _ = self.events.send(BreakerEvent::Opened);
            tracing::warn!("Circuit breaker re-opened after failed probe");
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        inner.window.record_failure(now);
        let (successes, failures) = inner.window.totals(now);
        let total = successes + failures;
        if total < self.config.volume_threshold {
            return;
        }

        let failure_pct = failures * 100 / total;
        if failure_pct >= u32::from(self.config.error_threshold_percentage) {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            let _ = self.events.send(BreakerEvent::Opened);
            tracing::warn!(
                failures,
                total,
                "Circuit breaker opened after error threshold reached"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GatewayErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_millis(10),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(50),
            volume_threshold: 1,
            rolling_count_timeout: Duration::from_secs(10),
            rolling_count_buckets: 10,
        }
    }

    fn downstream_error() -> GatewayError {
        GatewayError::new(GatewayErrorKind::ServiceUnavailable, "502 from origin")
    }

    #[tokio::test]
    async fn test_open_then_recover() {
        let breaker: CircuitBreaker<&str> = CircuitBreaker::new(fast_config());
        let calls = AtomicU32::new(0);

        // First call fails with the underlying error and opens the circuit.
        let error = breaker
            .fire(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<&str, _>(downstream_error())
            })
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), GatewayErrorKind::ServiceUnavailable);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Second call rejects circuit-open; the action is not invoked again.
        let error = breaker
            .fire(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<&str, _>(downstream_error())
            })
            .await
            .err()
            .unwrap();
        assert!(error.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // After the reset timeout the probe succeeds and closes the circuit.
        sleep(Duration::from_millis(60)).await;
        let value = breaker
            .fire(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("recovered")
            })
            .await
            .unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker: CircuitBreaker<()> = CircuitBreaker::new(fast_config());

        let error = breaker
            .fire(|| async {
                sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await
            .err()
            .unwrap();

        assert!(error.is_timeout());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_volume_threshold_gates_opening() {
        let breaker: CircuitBreaker<()> = CircuitBreaker::new(BreakerConfig {
            volume_threshold: 5,
            ..fast_config()
        });

        for _ in 0..4 {
            let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        }
        // 4 failures at 100% but below the volume threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker: CircuitBreaker<()> = CircuitBreaker::new(fast_config());

        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The reset timer restarted; still open before it elapses again.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_allows_single_probe() {
        let breaker: Arc<CircuitBreaker<&str>> = Arc::new(CircuitBreaker::new(fast_config()));
        let calls = Arc::new(AtomicU32::new(0));

        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        sleep(Duration::from_millis(60)).await;

        let probe_breaker = breaker.clone();
        let probe_calls = calls.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .fire(|| async move {
                    probe_calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    Ok("probe")
                })
                .await
        });

        // Give the probe time to claim the half-open slot.
        sleep(Duration::from_millis(1)).await;

        let concurrent_calls = calls.clone();
        let rejected = breaker
            .fire(|| async move {
                concurrent_calls.fetch_add(1, Ordering::SeqCst);
                Ok("should not run")
            })
            .await;
        assert!(rejected.err().unwrap().is_circuit_open());

        assert_eq!(probe.await.unwrap().unwrap(), "probe");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_substitutes_open_rejection() {
        let breaker = CircuitBreaker::new(fast_config())
            .with_fallback(|_| Ok("cached response"));

        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let value = breaker
            .fire(|| async { Ok("should not run") })
            .await
            .unwrap();
        assert_eq!(value, "cached response");
    }

    #[tokio::test]
    async fn test_transition_events() {
        let breaker: CircuitBreaker<()> = CircuitBreaker::new(fast_config());
        let mut events = breaker.subscribe();

        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;
        sleep(Duration::from_millis(60)).await;
        let _ = breaker.fire(|| async { Ok(()) }).await;

        assert_eq!(events.recv().await.unwrap(), BreakerEvent::Opened);
        assert_eq!(events.recv().await.unwrap(), BreakerEvent::HalfOpened);
        assert_eq!(events.recv().await.unwrap(), BreakerEvent::Closed);
    }

    #[tokio::test]
    async fn test_successes_keep_error_rate_below_threshold() {
        let breaker: CircuitBreaker<()> = CircuitBreaker::new(BreakerConfig {
            volume_threshold: 4,
            ..fast_config()
        });

        // 3 successes and 1 failure: 25% error rate, below the 50% threshold.
        for _ in 0..3 {
            breaker.fire(|| async { Ok(()) }).await.unwrap();
        }
        let _ = breaker.fire(|| async { Err(downstream_error()) }).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
