use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::{AppConfig, BackoffKind};
use crate::errors::{AppError, AppResult};
use crate::ingestion::AddressKind;
use crate::telemetry::{lookup_payload, DiagnosticsSink};

const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Resolved,
    NotFound,
    Failed,
}

/// One address queued for lookup, tagged with its row position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub index: usize,
    pub kind: AddressKind,
    pub query: String,
}

impl AddressRecord {
    pub fn new(index: usize, kind: AddressKind, query: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeOutcome {
    pub index: usize,
    pub coordinate: Option<Coordinate>,
    pub status: OutcomeStatus,
    pub attempts: u32,
}

impl GeocodeOutcome {
    pub fn resolved(index: usize, coordinate: Coordinate, attempts: u32) -> Self {
        Self {
            index,
            coordinate: Some(coordinate),
            status: OutcomeStatus::Resolved,
            attempts,
        }
    }

    pub fn not_found(index: usize, attempts: u32) -> Self {
        Self {
            index,
            coordinate: None,
            status: OutcomeStatus::NotFound,
            attempts,
        }
    }

    pub fn failed(index: usize, attempts: u32) -> Self {
        Self {
            index,
            coordinate: None,
            status: OutcomeStatus::Failed,
            attempts,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == OutcomeStatus::Resolved
    }
}

/// Answer from the geocoding service when the request itself succeeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupReply {
    Match(Coordinate),
    NoMatch,
}

/// A single call against the geocoding service.
///
/// Any `Err` is treated as transient and retried; `NoMatch` is final.
/// Implementations are shared across workers, so they must be safe for
/// concurrent use.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> AppResult<LookupReply>;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: BackoffKind,
    jitter_rng: Option<Arc<Mutex<StdRng>>>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: BackoffKind::Fixed,
            jitter_rng: None,
        }
    }

    /// Doubling delay with up to `delay` of random jitter added per attempt.
    pub fn exponential(max_attempts: u32, delay: Duration, rng: StdRng) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: BackoffKind::Exponential,
            jitter_rng: Some(Arc::new(Mutex::new(rng))),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        match config.backoff {
            BackoffKind::Fixed => Self::fixed(config.max_attempts, config.retry_delay()),
            BackoffKind::Exponential => Self::exponential(
                config.max_attempts,
                config.retry_delay(),
                StdRng::from_entropy(),
            ),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                let base = self.delay * (1 << exponent);
                let jitter_ms = match (&self.jitter_rng, self.delay.as_millis() as u64) {
                    (Some(rng), bound) if bound > 0 => rng.lock().gen_range(0..bound),
                    _ => 0,
                };
                base + Duration::from_millis(jitter_ms)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(
            crate::config::DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(crate::config::DEFAULT_RETRY_DELAY_MS),
        )
    }
}

/// Resolves addresses to coordinates with bounded retries.
///
/// Cloning is cheap; clones share the lookup backend, the rate limiter and
/// the diagnostics sink.
#[derive(Clone)]
pub struct GeocodeClient {
    lookup: Arc<dyn GeocodeLookup>,
    policy: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    diagnostics: DiagnosticsSink,
}

impl GeocodeClient {
    pub fn new(
        lookup: Arc<dyn GeocodeLookup>,
        policy: RetryPolicy,
        diagnostics: DiagnosticsSink,
    ) -> Self {
        Self {
            lookup,
            policy,
            rate_limiter: None,
            diagnostics,
        }
    }

    pub fn from_config(config: &AppConfig, diagnostics: DiagnosticsSink) -> AppResult<Self> {
        let lookup = NominatimClient::new(config)?;
        let client = Self::new(Arc::new(lookup), RetryPolicy::from_config(config), diagnostics);
        Ok(client.with_rate_limit(config.geocoder_rate_limit_qps))
    }

    /// Spaces out attempts across all clones; `0` disables throttling.
    pub fn with_rate_limit(mut self, qps: u32) -> Self {
        self.rate_limiter = (qps > 0).then(|| Arc::new(RateLimiter::new(qps)));
        self
    }

    pub async fn geocode(&self, record: &AddressRecord) -> GeocodeOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.wait().await;
            }
            match self.lookup.lookup(&record.query).await {
                Ok(LookupReply::Match(coordinate)) => {
                    trace!(
                        index = record.index,
                        kind = record.kind.as_tag(),
                        attempt,
                        "address resolved"
                    );
                    return GeocodeOutcome::resolved(record.index, coordinate, attempt);
                }
                Ok(LookupReply::NoMatch) => {
                    warn!(
                        index = record.index,
                        kind = record.kind.as_tag(),
                        query = %record.query,
                        "geocoder has no match for address"
                    );
                    self.report(record, "lookup_not_found", attempt, None);
                    return GeocodeOutcome::not_found(record.index, attempt);
                }
                Err(err) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        ?err,
                        index = record.index,
                        kind = record.kind.as_tag(),
                        attempt,
                        "geocode lookup failed; retrying after {:?}",
                        delay
                    );
                    self.report(record, "lookup_attempt_failed", attempt, Some(&err));
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        ?err,
                        index = record.index,
                        kind = record.kind.as_tag(),
                        query = %record.query,
                        attempt,
                        "geocode lookup failed after final attempt"
                    );
                    self.report(record, "lookup_attempt_failed", attempt, Some(&err));
                    self.report(record, "lookup_exhausted", attempt, Some(&err));
                    return GeocodeOutcome::failed(record.index, attempt);
                }
            }
        }
    }

    fn report(&self, record: &AddressRecord, event: &str, attempt: u32, err: Option<&AppError>) {
        let detail = err.map(|err| err.to_string());
        let mut payload = lookup_payload(record.index, &record.query, attempt, detail.as_deref());
        payload["kind"] = serde_json::Value::from(record.kind.as_tag());
        self.diagnostics.emit(event, payload);
    }
}

/// Keeps successive attempts at least `1 / qps` seconds apart.
pub struct RateLimiter {
    interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            interval: Duration::from_millis(1000_u64.div_ceil(u64::from(qps.max(1)))),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last_tick = self.last_tick.lock().await;
        if let Some(prev) = *last_tick {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *last_tick = Some(Instant::now());
    }
}

/// HTTP backend speaking the Nominatim search API.
///
/// Holds one `reqwest::Client`, which pools connections internally and is
/// safe to share between concurrent workers.
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.geocoder_timeout())
            .user_agent(config.geocoder_user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for NominatimClient {
    async fn lookup(&self, query: &str) -> AppResult<LookupReply> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let mut request = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        // Request URLs carry the address, so they are stripped from errors.
        let hits: Vec<SearchHit> = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(reqwest::Error::without_url)?
            .json()
            .await
            .map_err(reqwest::Error::without_url)?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(LookupReply::NoMatch);
        };

        let lat = hit
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Lookup(format!("invalid latitude {:?}: {err}", hit.lat)))?;
        let lng = hit
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Lookup(format!("invalid longitude {:?}: {err}", hit.lon)))?;
        debug!(lat, lng, "nominatim returned a match");
        Ok(LookupReply::Match(Coordinate::new(lat, lng)))
    }
}
