use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::model::Coordinate;

const MAX_BACKOFF_EXPONENT: u32 = 6;
/// Upper bound for any wait the limiter schedules, whether it comes from a
/// `Retry-After` header, the backoff or the configured minimum delay.
pub const MAX_DEFERRAL: Duration = Duration::from_secs(60 * 60);

/// Why a single lookup produced no coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    /// The service answered but had no match. Retrying will not help.
    #[error("no match found")]
    NotFound,
    #[error("transient lookup failure: {0}")]
    Transient(String),
    #[error("throttled by the lookup service")]
    RateLimited { retry_after: Option<Duration> },
}

impl ResolutionFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionFailure::NotFound => "not_found",
            ResolutionFailure::Transient(_) => "transient",
            ResolutionFailure::RateLimited { .. } => "rate_limited",
        }
    }
}

pub type LookupResult = Result<Coordinate, ResolutionFailure>;

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn geocode(&self, query: &str) -> LookupResult;
}

#[derive(Debug, Default)]
struct LimiterState {
    last_start: Option<Instant>,
    not_before: Option<Instant>,
}

/// Spaces request starts by a minimum delay and admits one request at a time.
///
/// Share one limiter (through `Arc`) between every resolver that talks to the
/// same service identity; the service's limit is per client, not per caller.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    state: Arc<AsyncMutex<LimiterState>>,
}

/// Held while a request is in flight. Dropping it lets the next request start.
pub struct RatePermit {
    guard: OwnedMutexGuard<LimiterState>,
}

impl RatePermit {
    /// Pushes back the earliest start of the next request.
    fn defer(&mut self, delay: Duration) {
        let candidate = deadline_after(Instant::now(), delay);
        let deferred = match self.guard.not_before {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        self.guard.not_before = Some(deferred);
    }
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(min_delay)),
            state: Arc::new(AsyncMutex::new(LimiterState::default())),
        }
    }

    pub fn set_min_delay(&self, min_delay: Duration) {
        self.min_interval_ms
            .store(Self::interval_ms(min_delay), Ordering::SeqCst);
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    fn interval_ms(min_delay: Duration) -> u64 {
        u64::try_from(min_delay.min(MAX_DEFERRAL).as_millis()).unwrap_or(u64::MAX)
    }

    /// Waits until the next request may start. Cancel-safe: dropping the
    /// future before it resolves leaves the schedule untouched.
    pub async fn acquire(&self) -> RatePermit {
        let mut guard = Arc::clone(&self.state).lock_owned().await;
        let mut start_at = guard
            .last_start
            .map(|prev| deadline_after(prev, self.min_delay()));
        if let Some(not_before) = guard.not_before {
            start_at = Some(start_at.map_or(not_before, |at| at.max(not_before)));
        }
        if let Some(at) = start_at {
            if at > Instant::now() {
                trace!(wait = ?(at - Instant::now()), "rate limiter delaying request");
                sleep_until(at).await;
            }
        }
        guard.last_start = Some(Instant::now());
        guard.not_before = None;
        RatePermit { guard }
    }
}

/// `from + delay`, with the delay capped at `MAX_DEFERRAL`. Falls back to `from`
/// when the clock cannot represent the sum.
fn deadline_after(from: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_DEFERRAL);
    from.checked_add(delay).unwrap_or(from)
}

/// Issues rate-limited lookups and classifies their outcome.
pub struct Resolver {
    lookup: Arc<dyn GeocodeLookup>,
    limiter: Arc<RateLimiter>,
    request_timeout: Duration,
    backoff_base: Duration,
    consecutive_throttles: AtomicU32,
    requests_issued: AtomicU64,
    jitter_rng: Mutex<StdRng>,
}

impl Resolver {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let lookup = NominatimClient::new(
            &config.geocoder_endpoint,
            &config.geocoder_user_agent,
            config.request_timeout(),
        )?;
        let limiter = Arc::new(RateLimiter::new(config.min_delay()));
        Ok(Self::with_lookup(Arc::new(lookup), limiter, config))
    }

    pub fn with_lookup(
        lookup: Arc<dyn GeocodeLookup>,
        limiter: Arc<RateLimiter>,
        config: &AppConfig,
    ) -> Self {
        Self {
            lookup,
            limiter,
            request_timeout: config.request_timeout(),
            backoff_base: config.rate_limit_backoff(),
            consecutive_throttles: AtomicU32::new(0),
            requests_issued: AtomicU64::new(0),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Mutex::new(rng);
        self
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Requests that got past the limiter, including ones that were later
    /// abandoned mid-flight.
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::SeqCst)
    }

    pub async fn resolve(&self, query: &str) -> LookupResult {
        let mut permit = self.limiter.acquire().await;
        self.requests_issued.fetch_add(1, Ordering::SeqCst);
        let outcome = match timeout(self.request_timeout, self.lookup.geocode(query)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolutionFailure::Transient(format!(
                "lookup timed out after {:?}",
                self.request_timeout
            ))),
        };

        match &outcome {
            Err(ResolutionFailure::RateLimited { retry_after }) => {
                let attempt = self.consecutive_throttles.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = retry_after
                    .unwrap_or_else(|| self.backoff_delay(attempt))
                    .min(MAX_DEFERRAL);
                warn!(query, attempt, "lookup service throttled us; backing off for {:?}", delay);
                permit.defer(delay);
            }
            Err(failure) => {
                self.consecutive_throttles.store(0, Ordering::SeqCst);
                debug!(query, kind = failure.kind(), %failure, "lookup failed");
            }
            Ok(coordinate) => {
                self.consecutive_throttles.store(0, Ordering::SeqCst);
                trace!(query, lat = coordinate.lat(), lon = coordinate.lon(), "lookup resolved");
            }
        }
        outcome
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.backoff_base.saturating_mul(1_u32 << exponent);
        let base_ms = u64::try_from(self.backoff_base.as_millis()).unwrap_or(u64::MAX);
        if base_ms == 0 {
            return base;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..base_ms);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Free-text search against a Nominatim-compatible endpoint.
pub struct NominatimClient {
    http: reqwest::Client,
    search_url: String,
}

impl NominatimClient {
    pub fn new(endpoint: &str, user_agent: &str, request_timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            search_url: format!("{}/search", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl GeocodeLookup for NominatimClient {
    async fn geocode(&self, query: &str) -> LookupResult {
        #[derive(serde::Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(&self.search_url)
            .query(&[("q", query), ("format", "jsonv2"), ("limit", "1")])
            .send()
            .await
            .map_err(|err| ResolutionFailure::Transient(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ResolutionFailure::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(ResolutionFailure::Transient(format!(
                "lookup service responded with {status}"
            )));
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|err| ResolutionFailure::Transient(format!("malformed response: {err}")))?;
        let Some(hit) = hits.into_iter().next() else {
            return Err(ResolutionFailure::NotFound);
        };

        let lat = hit.lat.trim().parse::<f64>();
        let lon = hit.lon.trim().parse::<f64>();
        match (lat, lon) {
            (Ok(lat), Ok(lon)) => Coordinate::new(lat, lon)
                .map_err(|err| ResolutionFailure::Transient(format!("malformed response: {err}"))),
            _ => Err(ResolutionFailure::Transient(format!(
                "malformed coordinates ({}, {})",
                hit.lat, hit.lon
            ))),
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
