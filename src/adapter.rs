//! Mapping between inbound requests, limiter decisions and client responses.
//!
//! This module is transport-agnostic: it produces a status code, a JSON body
//! and rate limit headers, and leaves writing them to whichever server
//! embeds the limiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::TurnstileError;
use crate::ratelimit::{Decision, DenialReason, Granularity, RateLimiter, Tier};

pub const HEADER_LIMIT_MINUTE: &str = "X-RateLimit-Limit-Minute";
pub const HEADER_REMAINING_MINUTE: &str = "X-RateLimit-Remaining-Minute";
pub const HEADER_REMAINING_HOUR: &str = "X-RateLimit-Remaining-Hour";
pub const HEADER_REMAINING_DAY: &str = "X-RateLimit-Remaining-Day";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// An admission request as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Caller identifier; required
    #[serde(default)]
    pub identifier: Option<String>,
    /// Subscription tier, if the caller already knows it
    #[serde(default)]
    pub tier: Option<String>,
    /// Endpoint to scope the quota to
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AdmissionRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::default()
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Error from an external tier lookup.
#[derive(Debug, thiserror::Error)]
#[error("tier lookup failed: {0}")]
pub struct TierLookupError(pub String);

/// Looks up the subscription tier of a caller.
pub trait TierResolver: Send + Sync {
    /// The caller's tier name, or `None` when the caller has no subscription.
    fn resolve_tier(&self, identifier: &str) -> Result<Option<String>, TierLookupError>;
}

/// Machine-readable failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    Blocked,
    ValidationError,
}

impl From<DenialReason> for ErrorCode {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            DenialReason::Blocked => ErrorCode::Blocked,
        }
    }
}

/// Remaining requests per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingQuota {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
}

/// When each window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetTimes {
    pub minute: DateTime<Utc>,
    pub hour: DateTime<Utc>,
    pub day: DateTime<Utc>,
}

/// Quota telemetry attached to an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub remaining: RemainingQuota,
    pub reset_at: ResetTimes,
}

/// Response body returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdmissionResponse {
    Allowed {
        ok: bool,
        tier: Tier,
        limits: QuotaLimits,
    },
    Denied {
        ok: bool,
        error: String,
        code: ErrorCode,
        retry_after_seconds: u64,
        limits: RemainingQuota,
        reset_at: ResetTimes,
    },
    Invalid {
        ok: bool,
        error: String,
        code: ErrorCode,
    },
}

impl AdmissionResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, AdmissionResponse::Allowed { .. })
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AdmissionResponse::Allowed { .. } => None,
            AdmissionResponse::Denied { code, .. } | AdmissionResponse::Invalid { code, .. } => {
                Some(*code)
            }
        }
    }
}

/// Everything a transport needs to answer the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionReply {
    /// HTTP-style status: 200, 400 or 429
    pub status: u16,
    pub body: AdmissionResponse,
    pub headers: Vec<(&'static str, String)>,
}

/// Translates requests into limiter calls and decisions into replies.
#[derive(Clone)]
pub struct AdmissionAdapter {
    limiter: Arc<RateLimiter>,
    resolver: Option<Arc<dyn TierResolver>>,
}

impl AdmissionAdapter {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            resolver: None,
        }
    }

    /// Use `resolver` for requests that do not name a tier.
    pub fn with_resolver(mut self, resolver: Arc<dyn TierResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Evaluate a request and build the reply.
    #[instrument(skip(self, request), fields(identifier = ?request.identifier))]
    pub fn admit(&self, request: &AdmissionRequest) -> AdmissionReply {
        let identifier = request.identifier.as_deref().unwrap_or_default();
        let tier = match &request.tier {
            Some(tier) => Some(tier.clone()),
            None => self.lookup_tier(identifier),
        };

        match self
            .limiter
            .evaluate(identifier, tier.as_deref(), request.endpoint.as_deref())
        {
            Ok(decision) => {
                let reply = reply_for(&decision);
                info!(
                    status = reply.status,
                    tier = %decision.tier,
                    code = ?reply.body.code(),
                    "Admission decision made"
                );
                reply
            }
            Err(e) => {
                warn!(error = %e, "Rejected invalid admission request");
                invalid_reply(&e)
            }
        }
    }

    fn lookup_tier(&self, identifier: &str) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        if identifier.trim().is_empty() {
            return None;
        }
        match resolver.resolve_tier(identifier) {
            Ok(tier) => {
                debug!(tier = ?tier, "Resolved tier");
                tier
            }
            Err(e) => {
                warn!(error = %e, "Tier lookup failed, using anonymous");
                None
            }
        }
    }
}

/// Build the reply for a limiter decision.
pub fn reply_for(decision: &Decision) -> AdmissionReply {
    let remaining = remaining_quota(decision);
    let reset_at = reset_times(decision);
    let headers = rate_limit_headers(decision);

    let (status, body) = match decision.denial_reason() {
        None => (
            200,
            AdmissionResponse::Allowed {
                ok: true,
                tier: decision.tier,
                limits: QuotaLimits {
                    remaining,
                    reset_at,
                },
            },
        ),
        Some(reason) => (
            429,
            AdmissionResponse::Denied {
                ok: false,
                error: denial_message(reason).to_string(),
                code: reason.into(),
                retry_after_seconds: decision.retry_after_secs().unwrap_or(1),
                limits: remaining,
                reset_at,
            },
        ),
    };

    AdmissionReply {
        status,
        body,
        headers,
    }
}

/// Rate limit headers for a decision; `Retry-After` only when denied.
pub fn rate_limit_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    let minute = decision.window(Granularity::Minute);
    let mut headers = vec![
        (
            HEADER_LIMIT_MINUTE,
            minute.map(|w| w.limit).unwrap_or_default().to_string(),
        ),
        (
            HEADER_REMAINING_MINUTE,
            remaining_in(decision, Granularity::Minute).to_string(),
        ),
        (
            HEADER_REMAINING_HOUR,
            remaining_in(decision, Granularity::Hour).to_string(),
        ),
        (
            HEADER_REMAINING_DAY,
            remaining_in(decision, Granularity::Day).to_string(),
        ),
        (
            HEADER_RESET,
            reset_in(decision, Granularity::Minute).timestamp().to_string(),
        ),
    ];

    if let Some(retry_after) = decision.retry_after_secs() {
        headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
    }
    headers
}

fn invalid_reply(error: &TurnstileError) -> AdmissionReply {
    AdmissionReply {
        status: 400,
        body: AdmissionResponse::Invalid {
            ok: false,
            error: error.to_string(),
            code: ErrorCode::ValidationError,
        },
        headers: Vec::new(),
    }
}

fn denial_message(reason: DenialReason) -> &'static str {
    match reason {
        DenialReason::RateLimitExceeded => "Rate limit exceeded",
        DenialReason::Blocked => "Temporarily blocked due to repeated rate limit violations",
    }
}

fn remaining_in(decision: &Decision, granularity: Granularity) -> u64 {
    decision
        .window(granularity)
        .map(|w| w.remaining)
        .unwrap_or_default()
}

fn reset_in(decision: &Decision, granularity: Granularity) -> DateTime<Utc> {
    decision
        .window(granularity)
        .map(|w| w.reset_at)
        .unwrap_or(decision.evaluated_at)
}

fn remaining_quota(decision: &Decision) -> RemainingQuota {
    RemainingQuota {
        per_minute: remaining_in(decision, Granularity::Minute),
        per_hour: remaining_in(decision, Granularity::Hour),
        per_day: remaining_in(decision, Granularity::Day),
    }
}

fn reset_times(decision: &Decision) -> ResetTimes {
    ResetTimes {
        minute: reset_in(decision, Granularity::Minute),
        hour: reset_in(decision, Granularity::Hour),
        day: reset_in(decision, Granularity::Day),
    }
}
