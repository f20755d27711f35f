//! Circuit breaker guarding cross-node broadcasts.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
///
/// `Closed` passes requests through; `Open` rejects them after the failure
/// threshold is crossed; `HalfOpen` lets a single probe decide whether the
/// downstream has recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{name}")
    }
}

/// Lock-free three-state circuit breaker.
///
/// All transitions use compare-and-set so concurrent failures cannot
/// over-count a transition. The open → half-open move is evaluated lazily on
/// [`CircuitBreaker::allow_request`].
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    created: Instant,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    // Millis since `created`; 0 means "never failed".
    last_failure_millis: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            open_timeout,
            created: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed right now.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.open_elapsed() {
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        info!("circuit breaker {} transitioning to HALF_OPEN", self.name);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful operation; a half-open probe success closes the
    /// breaker and resets the failure count.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.fetch_add(1, Ordering::Relaxed);

        if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
            info!(
                "circuit breaker {} CLOSED after successful half-open probe",
                self.name
            );
        }
    }

    /// Records a failed operation; crossing the threshold in closed state or
    /// failing the half-open probe opens the breaker.
    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.touch_last_failure();

        if failures >= self.failure_threshold
            && self.transition(CircuitState::Closed, CircuitState::Open)
        {
            warn!(
                "circuit breaker {} OPENED after {failures} failures (threshold {})",
                self.name, self.failure_threshold
            );
        }

        if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
            info!(
                "circuit breaker {} back to OPEN after half-open probe failure",
                self.name
            );
        }
    }

    /// Forces the breaker back to closed and clears all counters.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed.as_u8(), Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.last_failure_millis.store(0, Ordering::Release);
        info!("circuit breaker {} manually reset to CLOSED", self.name);
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> u32 {
        self.success_count.load(Ordering::Acquire)
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn touch_last_failure(&self) {
        let millis = self.created.elapsed().as_millis() as u64;
        self.last_failure_millis.store(millis, Ordering::Release);
    }

    fn open_elapsed(&self) -> bool {
        let last = self.last_failure_millis.load(Ordering::Acquire);
        let now = self.created.elapsed().as_millis() as u64;
        now.saturating_sub(last) >= self.open_timeout.as_millis() as u64
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .field("successes", &self.success_count())
            .finish()
    }
}
