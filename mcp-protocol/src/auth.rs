//! Token validation, rate limiting and scope checks.
//!
//! Every RPC call passes through [`TokenValidator::validate`] before the
//! facade runs. Lookups hash the trimmed bearer string with SHA-256 and
//! hit a short-lived in-memory cache before the token store. Sliding
//! windows (minute, burst, hour) are tracked per token hash; repeated
//! validation failures are flagged as suspicious.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use taskloom_core::{
    error::{Result, TaskError},
    repository::TokenRepository,
    token::{is_recognised_token_format, required_scope, TokenInfo},
};

/// Sliding-window limits applied per token hash.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per 60 s window (overridable per token).
    pub requests_per_minute: u32,
    /// Requests per 3600 s window.
    pub requests_per_hour: u32,
    /// Requests per 10 s burst window.
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            requests_per_hour: 1000,
            burst_limit: 20,
        }
    }
}

/// How close a token is to its limits right now.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub requests_per_minute: u32,
    pub minute_limit: u32,
    pub requests_per_hour: u32,
    pub hour_limit: u32,
    pub remaining_minute: u32,
    pub remaining_hour: u32,
}

/// Counts of validator-internal state, surfaced by `manage_token.stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatorStats {
    pub cached_tokens: usize,
    pub rate_limited_tokens: usize,
    pub failed_attempt_records: usize,
}

/// Client metadata attached to security logging.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

const TOKEN_CACHE_TTL_SECS: u64 = 300;
const FAILURE_WINDOW: Duration = Duration::from_secs(3600);
const SUSPICIOUS_FAILURES: usize = 5;

/// SHA-256 hex digest of a raw bearer token. The raw string never goes
/// anywhere else.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Token validation and rate limiting, shared across request handlers.
pub struct TokenValidator {
    tokens: Arc<dyn TokenRepository>,
    config: RateLimitConfig,
    cache_ttl: Duration,
    /// token hash → (info, cached-at)
    cache: Mutex<HashMap<String, (TokenInfo, Instant)>>,
    /// token hash → accepted-request timestamps, trimmed to one hour
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    /// token hash → failed-validation timestamps
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl TokenValidator {
    pub fn new(tokens: Arc<dyn TokenRepository>, config: RateLimitConfig) -> Self {
        Self::with_cache_ttl(tokens, config, Duration::from_secs(TOKEN_CACHE_TTL_SECS))
    }

    pub fn with_cache_ttl(
        tokens: Arc<dyn TokenRepository>,
        config: RateLimitConfig,
        cache_ttl: Duration,
    ) -> Self {
        info!(
            per_minute = config.requests_per_minute,
            burst = config.burst_limit,
            per_hour = config.requests_per_hour,
            "Token validator initialised"
        );
        Self {
            tokens,
            config,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a bearer token and enforce its rate limits.
    ///
    /// The scheme prefix is stripped and the token trimmed before hashing.
    /// Inactive, expired or unknown tokens fail with `INVALID_TOKEN`; a
    /// token over any window fails with `RATE_LIMIT_EXCEEDED` and the
    /// request is not recorded.
    pub async fn validate(&self, raw: &str, client_info: &ClientInfo) -> Result<TokenInfo> {
        let token = raw.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(TaskError::InvalidToken("Token is required".to_string()));
        }
        if !is_recognised_token_format(token) {
            let hash = hash_token(token);
            self.record_failure(&hash, "unrecognised_format", client_info).await;
            return Err(TaskError::InvalidToken(
                "Unrecognised token format".to_string(),
            ));
        }

        let hash = hash_token(token);

        let info = match self.lookup(&hash).await? {
            Some(info) => info,
            None => {
                self.record_failure(&hash, "invalid_token", client_info).await;
                return Err(TaskError::InvalidToken(
                    "Invalid or expired token".to_string(),
                ));
            }
        };

        if let Err(err) = self.check_rate_limit(&hash, info.rate_limit).await {
            self.record_failure(&hash, "rate_limit_exceeded", client_info).await;
            return Err(err);
        }

        // Usage tracking is best-effort; the call already succeeded.
        if let Err(err) = self.tokens.touch(info.token_id, Utc::now()).await {
            warn!(error = %err, "Failed to record token usage");
        }

        debug!(user_id = %info.user_id, "Token validated");
        Ok(info)
    }

    /// Revoke a raw token: clears the cache entry and deactivates the
    /// stored row. Returns whether a token was actually revoked.
    pub async fn revoke(&self, raw: &str) -> Result<bool> {
        let hash = hash_token(raw.trim().strip_prefix("Bearer ").unwrap_or(raw).trim());
        self.cache.lock().await.remove(&hash);

        let Some(mut token) = self.tokens.get_by_hash(&hash).await? else {
            return Ok(false);
        };
        if !token.is_active {
            return Ok(false);
        }
        token.is_active = false;
        self.tokens.save(token).await?;
        info!("Token revoked");
        Ok(true)
    }

    /// Drop a hash from the validation cache (used after revoke-by-id).
    pub async fn forget(&self, token_hash: &str) {
        self.cache.lock().await.remove(token_hash);
    }

    async fn lookup(&self, hash: &str) -> Result<Option<TokenInfo>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some((info, cached_at)) = cache.get(hash) {
                if cached_at.elapsed() < self.cache_ttl {
                    debug!("Token found in cache");
                    return Ok(Some(info.clone()));
                }
                cache.remove(hash);
            }
        }

        let Some(token) = self.tokens.get_by_hash(hash).await? else {
            return Ok(None);
        };
        if !token.is_active || token.is_expired(Utc::now()) {
            return Ok(None);
        }

        let info = TokenInfo::from(&token);
        self.cache
            .lock()
            .await
            .insert(hash.to_string(), (info.clone(), Instant::now()));
        Ok(Some(info))
    }

    /// Enforce minute/burst/hour windows; on acceptance the request is
    /// recorded into the deque.
    async fn check_rate_limit(&self, hash: &str, token_rate_limit: u32) -> Result<()> {
        let minute_limit = if token_rate_limit > 0 {
            token_rate_limit
        } else {
            self.config.requests_per_minute
        };

        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let requests = windows.entry(hash.to_string()).or_default();

        // Only the last hour matters for any window.
        while let Some(front) = requests.front() {
            if now.duration_since(*front) > Duration::from_secs(3600) {
                requests.pop_front();
            } else {
                break;
            }
        }

        let minute_count = count_in_window(requests, now, Duration::from_secs(60));
        if minute_count >= minute_limit {
            warn!(minute_count, minute_limit, "Rate limit exceeded");
            return Err(TaskError::RateLimitExceeded(format!(
                "{minute_count}/{minute_limit} requests per minute"
            )));
        }

        let burst_count = count_in_window(requests, now, Duration::from_secs(10));
        if burst_count >= self.config.burst_limit {
            warn!(burst_count, burst_limit = self.config.burst_limit, "Burst limit exceeded");
            return Err(TaskError::RateLimitExceeded(format!(
                "{burst_count}/{} requests per 10 seconds",
                self.config.burst_limit
            )));
        }

        if requests.len() as u32 >= self.config.requests_per_hour {
            warn!(
                hour_count = requests.len(),
                hour_limit = self.config.requests_per_hour,
                "Hourly limit exceeded"
            );
            return Err(TaskError::RateLimitExceeded(format!(
                "{}/{} requests per hour",
                requests.len(),
                self.config.requests_per_hour
            )));
        }

        requests.push_back(now);
        Ok(())
    }

    async fn record_failure(&self, hash: &str, reason: &str, client_info: &ClientInfo) {
        let now = Instant::now();
        let mut failures = self.failures.lock().await;
        let entries = failures.entry(hash.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) > FAILURE_WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries.push_back(now);

        if entries.len() >= SUSPICIOUS_FAILURES {
            warn!(
                failures = entries.len(),
                reason,
                remote_addr = client_info.remote_addr.as_deref().unwrap_or("unknown"),
                "Multiple failed token validations in the last hour"
            );
        } else {
            debug!(reason, "Token validation failed");
        }
    }

    /// Window usage for a raw token.
    pub async fn rate_limit_status(&self, raw: &str) -> RateLimitStatus {
        let hash = hash_token(raw);
        let now = Instant::now();
        let windows = self.windows.lock().await;
        let (minute, hour) = windows
            .get(&hash)
            .map(|requests| {
                let minute = requests
                    .iter()
                    .filter(|t| now.duration_since(**t) <= Duration::from_secs(60))
                    .count() as u32;
                let hour = requests
                    .iter()
                    .filter(|t| now.duration_since(**t) <= Duration::from_secs(3600))
                    .count() as u32;
                (minute, hour)
            })
            .unwrap_or((0, 0));

        RateLimitStatus {
            requests_per_minute: minute,
            minute_limit: self.config.requests_per_minute,
            requests_per_hour: hour,
            hour_limit: self.config.requests_per_hour,
            remaining_minute: self.config.requests_per_minute.saturating_sub(minute),
            remaining_hour: self.config.requests_per_hour.saturating_sub(hour),
        }
    }

    pub async fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            cached_tokens: self.cache.lock().await.len(),
            rate_limited_tokens: self.windows.lock().await.len(),
            failed_attempt_records: self.failures.lock().await.len(),
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        info!("Token cache cleared");
    }
}

fn count_in_window(requests: &VecDeque<Instant>, now: Instant, window: Duration) -> u32 {
    requests
        .iter()
        .filter(|t| now.duration_since(**t) <= window)
        .count() as u32
}

/// Check that a token grants the scope a tool action requires. Unknown
/// tool/action pairs are rejected here and reported as unknown actions by
/// the facade.
pub fn check_scope(info: &TokenInfo, tool: &str, action: &str) -> Result<()> {
    let Some(required) = required_scope(tool, action) else {
        return Err(TaskError::unknown_action(tool, action));
    };
    if info.scopes.iter().any(|scope| scope.grants(&required)) {
        Ok(())
    } else {
        Err(TaskError::PermissionDenied(format!(
            "scope '{required}' is required for {tool}.{action}"
        )))
    }
}
