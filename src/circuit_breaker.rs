//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered, with a bounded number of probes
//!
//! All state lives behind one mutex that is never held while the protected
//! operation runs. Transitions are published on a broadcast channel and to an
//! optional callback; neither is awaited by the breaker.

use crate::error::{ResilienceError, Result};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Buffered state-change events per breaker before slow subscribers lag
const EVENT_CAPACITY: usize = 64;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A transition between two circuit states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Name of the breaker that changed
    pub name: String,
    /// State before the transition
    pub from: CircuitState,
    /// State after the transition
    pub to: CircuitState,
    /// When the transition happened
    pub at: Instant,
}

/// Observer invoked on every state transition
pub type StateChangeCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Configuration for circuit breaker behavior
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// Duration to wait after the last failure before probing in half-open
    pub open_timeout: Duration,
    /// Maximum number of probes in flight while half-open
    pub max_half_open_probes: u32,
    /// Called off the hot path on every transition
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            max_half_open_probes: 1,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("max_half_open_probes", &self.max_half_open_probes)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Attach a state-change observer
    pub fn with_state_change_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Zero thresholds or budgets would wedge the state machine; treat them as 1
    fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.success_threshold = self.success_threshold.max(1);
        self.max_half_open_probes = self.max_half_open_probes.max(1);
        self
    }
}

/// Point-in-time view of a breaker's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Time of the most recent recorded failure (or forced open)
    pub last_failure: Option<Instant>,
    /// Probes currently in flight while half-open
    pub half_open_admitted: u32,
}

/// How a finished call is accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Finished without saying anything about downstream health
    Ignored,
}

impl Outcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.should_trip_breaker() => Outcome::Failure,
            Err(_) => Outcome::Ignored,
        }
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    half_open_admitted: u32,
    /// Bumped on every transition so late outcomes from a previous state are dropped
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            half_open_admitted: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, now: Instant) -> Option<StateChange> {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_admitted = 0;
        self.generation += 1;
        if to == CircuitState::Open {
            self.last_failure = Some(now);
        }

        (from != to).then(|| StateChange {
            name: name.to_string(),
            from,
            to,
            at: now,
        })
    }

    /// Move an expired Open circuit to HalfOpen
    fn refresh(
        &mut self,
        name: &str,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Option<StateChange> {
        if self.state != CircuitState::Open {
            return None;
        }
        let expired = self.last_failure.map_or(true, |at| {
            now.saturating_duration_since(at) >= config.open_timeout
        });
        if expired {
            self.transition(name, CircuitState::HalfOpen, now)
        } else {
            None
        }
    }

    fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure: self.last_failure,
            half_open_admitted: self.half_open_admitted,
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap and yields a handle to the same breaker.
///
/// # Example
/// ```no_run
/// use bulwark::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("billing-api", CircuitBreakerConfig::default());
///
///     let result = breaker.execute(|| async {
///         // Your operation here
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    events: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config.normalized()),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
            events,
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying an elapsed open timeout
    pub fn state(&self) -> CircuitState {
        self.metrics().state
    }

    /// Snapshot of state and counters
    pub fn metrics(&self) -> BreakerMetrics {
        let (metrics, change) = {
            let mut state = self.state.lock();
            let change = state.refresh(&self.name, &self.config, Instant::now());
            (state.metrics(), change)
        };
        self.publish(change);
        metrics
    }

    /// Receive every subsequent state transition
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Open the circuit regardless of counters
    ///
    /// The open timeout starts now, after which probing resumes as usual.
    pub fn force_open(&self) {
        let change = self
            .state
            .lock()
            .transition(&self.name, CircuitState::Open, Instant::now());
        tracing::warn!(breaker = %self.name, "circuit breaker forced open");
        self.publish(change);
    }

    /// Close the circuit regardless of counters
    pub fn force_close(&self) {
        let change = self
            .state
            .lock()
            .transition(&self.name, CircuitState::Closed, Instant::now());
        tracing::warn!(breaker = %self.name, "circuit breaker forced closed");
        self.publish(change);
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] without invoking `op` while
    /// the circuit is open, and with [`ResilienceError::TooManyRequests`] when
    /// the half-open probe budget is taken.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = op().await;
        admission.complete(&result);
        result
    }

    /// Execute an operation, giving up as soon as `cancel` fires
    ///
    /// A cancelled call is not counted as a success or a failure.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        let admission = self.admit()?;

        tokio::select! {
            result = op() => {
                admission.complete(&result);
                result
            }
            _ = cancel.cancelled() => {
                drop(admission);
                Err(ResilienceError::Cancelled)
            }
        }
    }

    /// Execute an operation with circuit breaker protection and retry logic
    ///
    /// Transient failures are retried with the policy's exponential backoff.
    /// Rejections by the breaker itself end the loop immediately. Each attempt
    /// and each backoff races `cancel`.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.execute_with_cancel(cancel, &mut op).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let backoff = policy.delay_for(attempt);
                    tracing::debug!(
                        breaker = %self.name,
                        attempt,
                        ?backoff,
                        error = %e,
                        "retrying after transient failure"
                    );
                    sleep_or_cancel(cancel, backoff).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check circuit state and reserve a slot for one call
    fn admit(&self) -> Result<Admission<'_>> {
        let (decision, change) = {
            let mut state = self.state.lock();
            let change = state.refresh(&self.name, &self.config, Instant::now());

            let decision = match state.state {
                CircuitState::Closed => Ok(state.generation),
                CircuitState::Open => Err(ResilienceError::CircuitOpen),
                CircuitState::HalfOpen
                    if state.half_open_admitted >= self.config.max_half_open_probes =>
                {
                    Err(ResilienceError::TooManyRequests)
                }
                CircuitState::HalfOpen => {
                    state.half_open_admitted += 1;
                    Ok(state.generation)
                }
            };
            (decision, change)
        };
        self.publish(change);

        match decision {
            Ok(generation) => Ok(Admission {
                breaker: self,
                generation,
                settled: false,
            }),
            Err(e) => {
                tracing::debug!(breaker = %self.name, error = %e, "call rejected");
                Err(e)
            }
        }
    }

    /// Account for a finished call and drive the transition table
    fn record(&self, generation: u64, outcome: Outcome) {
        let now = Instant::now();
        let change = {
            let mut state = self.state.lock();
            if state.generation != generation {
                // Circuit moved on while the call was in flight
                return;
            }
            if state.state == CircuitState::HalfOpen {
                state.half_open_admitted = state.half_open_admitted.saturating_sub(1);
            }

            match (state.state, outcome) {
                (CircuitState::Closed, Outcome::Success) => {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                    None
                }
                (CircuitState::Closed, Outcome::Failure) => {
                    state.consecutive_successes = 0;
                    state.consecutive_failures += 1;
                    state.last_failure = Some(now);
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.transition(&self.name, CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Success) => {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        state.transition(&self.name, CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Failure) => {
                    state.transition(&self.name, CircuitState::Open, now)
                }
                (_, Outcome::Ignored) | (CircuitState::Open, _) => None,
            }
        };
        self.publish(change);
    }

    /// Fan a transition out to the log, subscribers and the callback
    fn publish(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        tracing::info!(
            breaker = %change.name,
            from = %change.from,
            to = %change.to,
            "circuit breaker state changed"
        );

        // No subscribers is not an error
        let _ = self.events.send(change.clone());

        if let Some(callback) = &self.config.on_state_change {
            let callback = Arc::clone(callback);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || callback(&change));
                }
                Err(_) => {
                    std::thread::spawn(move || callback(&change));
                }
            }
        }
    }
}

/// Slot reserved by a call that passed the breaker
///
/// Dropping it without [`Admission::complete`] (the caller's future was
/// dropped mid-flight) hands a half-open probe slot back without recording
/// an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn complete<T>(mut self, result: &Result<T>) {
        self.settled = true;
        self.breaker.record(self.generation, Outcome::of(result));
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, Outcome::Ignored);
        }
    }
}

/// Named breakers sharing one template configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    template: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Create a new empty registry
    pub fn new(template: CircuitBreakerConfig) -> Self {
        Self {
            template,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Breaker for `name`, created from the template on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.template.clone()))),
        )
    }

    /// Find a breaker by name
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metrics of every registered breaker, sorted by name
    pub fn snapshot(&self) -> Vec<(String, BreakerMetrics)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut snapshot: Vec<(String, BreakerMetrics)> = breakers
            .iter()
            .map(|breaker| (breaker.name().to_string(), breaker.metrics()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}
