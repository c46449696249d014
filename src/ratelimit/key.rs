//! Rate limit key generation.

use super::window::Granularity;

/// The caller a request is accounted against.
///
/// Block and violation state is tracked per `identifier`; window quotas are
/// tracked per effective key, which also includes the endpoint when one is
/// given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Caller identifier (API key, IP address, ...)
    pub identifier: String,
    /// Optional endpoint that scopes the window quotas
    pub endpoint: Option<String>,
}

impl RateLimitKey {
    /// Create a key for a caller, optionally scoped to an endpoint.
    pub fn new(identifier: &str, endpoint: Option<&str>) -> Self {
        Self {
            identifier: identifier.to_string(),
            endpoint: endpoint.filter(|e| !e.is_empty()).map(str::to_string),
        }
    }

    /// The key window quotas are stored under: `identifier[:endpoint]`.
    pub fn effective_key(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}:{}", self.identifier, endpoint),
            None => self.identifier.clone(),
        }
    }

    /// The storage key of one window for this caller.
    pub fn window_key(&self, granularity: Granularity) -> WindowKey {
        WindowKey::new(self.effective_key(), granularity)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.effective_key())
    }
}

/// Storage key of a single window entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Effective key of the caller
    pub key: String,
    /// Window granularity
    pub granularity: Granularity,
}

impl WindowKey {
    pub fn new(key: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            key: key.into(),
            granularity,
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.key, self.granularity)
    }
}
