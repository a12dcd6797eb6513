//! REST client for the Wildberries supplies API.

use crate::{CoefficientSource, CredentialRateLimiter, RetryPolicy, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use slotwatch_core::{
    CoefficientSnapshot, Credential, CredentialKey, Reading, Warehouse, WarehouseId,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Marker in warehouse names for sorting centres, which do not accept supplies.
const SORTING_CENTRE_MARKER: &str = "СЦ";

/// Connection settings for the supplies API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// API base URL
    pub base_url: String,
    /// Per-request timeout (ms)
    pub timeout_ms: u64,
    /// Extra attempts for transient failures inside a single fetch
    pub max_transient_retries: u32,
    /// Delay before the first internal retry (ms)
    pub retry_initial_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://supplies-api.wildberries.ru".to_string(),
            timeout_ms: 10_000,
            max_transient_retries: 1,
            retry_initial_delay_ms: 500,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One row of the acceptance coefficients response.
#[derive(Debug, Clone, Deserialize)]
pub struct CoefficientEntry {
    pub date: Option<String>,
    pub coefficient: f64,
    #[serde(rename = "warehouseID")]
    pub warehouse_id: u64,
    #[serde(rename = "warehouseName", default)]
    pub warehouse_name: String,
    #[serde(rename = "boxTypeName", default)]
    pub box_type_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WarehouseEntry {
    #[serde(rename = "ID")]
    id: u64,
    name: String,
}

/// Supplies API client.
///
/// The first attempt of a coefficients request is admitted by the caller
/// (the snapshot cache). Internal retries of that request take their own
/// token from the limiter set with [`WildberriesClient::with_limiter`].
pub struct WildberriesClient {
    client: reqwest::Client,
    config: SourceConfig,
    retry: RetryPolicy,
    limiter: Option<Arc<CredentialRateLimiter>>,
}

impl WildberriesClient {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("slotwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Transient(format!("failed to build HTTP client: {e}")))?;

        let retry = RetryPolicy::new(
            config.retry_initial_delay_ms,
            config.retry_initial_delay_ms.saturating_mul(4),
            config.max_transient_retries,
        );

        Ok(Self {
            client,
            config,
            retry,
            limiter: None,
        })
    }

    /// Charge coefficient request retries to `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<CredentialRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// GET with bounded retries for transient failures only.
    ///
    /// With `rate_limited` set, each retry is charged to the limiter.
    async fn get(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
        rate_limited: bool,
    ) -> Result<Vec<u8>, SourceError> {
        let limiter = self.limiter.as_deref().filter(|_| rate_limited);
        retry_transient(&self.retry, limiter, &credential.key(), path, || {
            self.get_once(credential, path, query)
        })
        .await
    }

    async fn get_once(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, SourceError> {
        let mut request = self
            .client
            .get(self.url(path))
            .header(AUTHORIZATION, credential.expose());
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if let Some(err) = status_error(status, retry_after.as_deref()) {
            return Err(err);
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl CoefficientSource for WildberriesClient {
    async fn fetch(
        &self,
        credential: &Credential,
        warehouses: &BTreeSet<WarehouseId>,
    ) -> Result<CoefficientSnapshot, SourceError> {
        let ids = warehouses
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let query = [("warehouseIDs", ids)];

        let body = self
            .get(credential, "/api/v1/acceptance/coefficients", &query, true)
            .await?;
        let entries: Vec<CoefficientEntry> = serde_json::from_slice(&body)?;

        let snapshot = build_snapshot(entries, warehouses.clone(), Utc::now());
        debug!(
            credential = %credential.key(),
            requested = warehouses.len(),
            available = snapshot.len(),
            "Fetched acceptance coefficients"
        );
        Ok(snapshot)
    }

    async fn validate(&self, credential: &Credential) -> Result<(), SourceError> {
        self.get(credential, "/ping", &[], false).await.map(|_| ())
    }

    async fn warehouses(&self, credential: &Credential) -> Result<Vec<Warehouse>, SourceError> {
        let body = self.get(credential, "/api/v1/warehouses", &[], false).await?;
        let entries: Vec<WarehouseEntry> = serde_json::from_slice(&body)?;

        let total = entries.len();
        let warehouses: Vec<Warehouse> = entries
            .into_iter()
            .filter(|w| !w.name.contains(SORTING_CENTRE_MARKER))
            .map(|w| Warehouse {
                id: WarehouseId(w.id),
                name: CompactString::from(w.name),
            })
            .collect();

        debug!(
            total,
            accepted = warehouses.len(),
            "Fetched warehouse catalog"
        );
        Ok(warehouses)
    }
}

/// Run `attempt` until it succeeds, fails for good, or runs out of retries.
///
/// Only `Transient` failures are retried. When a limiter is given, every
/// retry waits for a token first and gives up with `RateLimited` if none
/// frees up within the limiter's wait budget.
async fn retry_transient<T, F, Fut>(
    retry: &RetryPolicy,
    limiter: Option<&CredentialRateLimiter>,
    key: &CredentialKey,
    path: &str,
    mut attempt: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(SourceError::Transient(reason)) => {
                retries += 1;
                if !retry.should_retry(retries) {
                    return Err(SourceError::Transient(reason));
                }
                let delay = retry.calculate_delay_duration(retries);
                debug!(
                    credential = %key,
                    path,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Retrying transient source failure"
                );
                tokio::time::sleep(delay).await;
                if let Some(limiter) = limiter {
                    limiter.acquire_within(key, limiter.config().max_wait()).await?;
                }
            }
            other => return other,
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn status_error(status: StatusCode, retry_after: Option<&str>) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }

    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SourceError::Auth(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::REQUEST_TIMEOUT => SourceError::Transient(format!("HTTP {}", status.as_u16())),
        s if s.is_server_error() => SourceError::Transient(format!("HTTP {}", s.as_u16())),
        s => {
            warn!(status = s.as_u16(), "Unexpected status from supplies API");
            SourceError::MalformedResponse(format!("unexpected HTTP {}", s.as_u16()))
        }
    };
    Some(err)
}

/// Reduce raw rows to one reading per warehouse.
///
/// Rows with a negative coefficient (acceptance closed) are dropped. The
/// lowest remaining coefficient wins; on ties the earliest date wins.
/// Rows for warehouses outside `requested` are ignored unless `requested`
/// is empty.
pub fn build_snapshot(
    entries: Vec<CoefficientEntry>,
    requested: BTreeSet<WarehouseId>,
    fetched_at: DateTime<Utc>,
) -> CoefficientSnapshot {
    let mut snapshot = CoefficientSnapshot::new(requested, fetched_at);

    for entry in entries {
        if entry.coefficient < 0.0 || !entry.coefficient.is_finite() {
            continue;
        }
        let id = WarehouseId(entry.warehouse_id);
        if !snapshot.requested.is_empty() && !snapshot.requested.contains(&id) {
            continue;
        }

        let candidate = Reading {
            coefficient: entry.coefficient,
            warehouse_name: CompactString::from(entry.warehouse_name),
            date: entry.date.map(CompactString::from),
            box_type: entry.box_type_name.map(CompactString::from),
        };

        match snapshot.readings.get(&id) {
            Some(current) if !is_better(&candidate, current) => {}
            _ => {
                snapshot.readings.insert(id, candidate);
            }
        }
    }

    snapshot
}

fn is_better(candidate: &Reading, current: &Reading) -> bool {
    if candidate.coefficient != current.coefficient {
        return candidate.coefficient < current.coefficient;
    }
    match (&candidate.date, &current.date) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        _ => false,
    }
}
