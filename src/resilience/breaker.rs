use crate::MeshError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rolling request counts inside the current interval window. Passed to the
/// trip predicate on every completion while Closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.requests += 1;
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.requests += 1;
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct BreakerSettings {
    /// Consecutive successes required in Half-Open before closing; also the
    /// cap on concurrent probes.
    pub max_requests_half_open: u32,
    /// Rolling window over which counts accumulate while Closed.
    pub interval: Duration,
    /// Time spent Open before admitting a probe.
    pub timeout: Duration,
    pub trip: TripPredicate,
}

impl BreakerSettings {
    /// Default trip predicate: at least `min_requests` completions and a
    /// failure ratio at or above `ratio`.
    pub fn with_defaults(min_requests: u32, ratio: f64) -> Self {
        Self {
            max_requests_half_open: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            trip: Arc::new(move |counts: &Counts| {
                counts.requests >= min_requests
                    && f64::from(counts.failures) >= ratio * f64::from(counts.requests)
            }),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::with_defaults(5, 0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

enum State {
    Closed { window_start: Instant },
    Open { since: Instant },
    HalfOpen { successes: u32, active_probes: u32 },
}

struct Inner {
    state: State,
    counts: Counts,
}

/// Circuit breaker shared across concurrent requests. In Open, calls
/// short-circuit with [`MeshError::CircuitOpen`] without reaching the
/// wrapped future.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: State::Closed {
                    window_start: Instant::now(),
                },
                counts: Counts::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> BreakerState {
        match self.inner.lock().await.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub async fn counts(&self) -> Counts {
        self.inner.lock().await.counts
    }

    /// Run `fut` through the breaker. Admission is decided before the
    /// future is polled; the lock is never held across the await.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, MeshError>
    where
        F: Future<Output = Result<T, MeshError>>,
    {
        self.admit().await?;
        let result = fut.await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    async fn admit(&self) -> Result<(), MeshError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &mut inner.state {
            State::Closed { window_start } => {
                if window_start.elapsed() >= self.settings.interval {
                    *window_start = Instant::now();
                    inner.counts = Counts::default();
                }
                Ok(())
            }
            State::Open { since } => {
                if since.elapsed() >= self.settings.timeout {
                    info!("breaker '{}': Open -> HalfOpen", self.name);
                    inner.state = State::HalfOpen {
                        successes: 0,
                        active_probes: 1,
                    };
                    Ok(())
                } else {
                    Err(MeshError::CircuitOpen(self.name.clone()))
                }
            }
            State::HalfOpen {
                successes,
                active_probes,
            } => {
                // Cap in-flight probes so concurrent callers can't all slip
                // through before the first result lands.
                if *active_probes + *successes >= self.settings.max_requests_half_open {
                    Err(MeshError::CircuitOpen(self.name.clone()))
                } else {
                    *active_probes += 1;
                    Ok(())
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &mut inner.state {
            State::Closed { .. } => inner.counts.on_success(),
            State::HalfOpen {
                successes,
                active_probes,
            } => {
                *active_probes = active_probes.saturating_sub(1);
                *successes += 1;
                if *successes >= self.settings.max_requests_half_open {
                    info!(
                        "breaker '{}': HalfOpen -> Closed after {} probe(s)",
                        self.name, successes
                    );
                    inner.state = State::Closed {
                        window_start: Instant::now(),
                    };
                    inner.counts = Counts::default();
                }
            }
            // Result of a call admitted before the trip; nothing to count.
            State::Open { .. } => {}
        }
    }

    async fn record_failure(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &mut inner.state {
            State::Closed { .. } => {
                inner.counts.on_failure();
                if (self.settings.trip)(&inner.counts) {
                    warn!(
                        "breaker '{}' tripped ({}/{} failures): Closed -> Open",
                        self.name, inner.counts.failures, inner.counts.requests
                    );
                    inner.state = State::Open {
                        since: Instant::now(),
                    };
                    inner.counts = Counts::default();
                }
            }
            State::HalfOpen { .. } => {
                warn!("breaker '{}': probe failed, HalfOpen -> Open", self.name);
                inner.state = State::Open {
                    since: Instant::now(),
                };
                inner.counts = Counts::default();
            }
            State::Open { .. } => {}
        }
    }
}
