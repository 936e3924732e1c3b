use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use http::Method;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::auth::AuthenticatedUser;

/// Per-request state, created by the outermost middleware and carried in the
/// request extensions for the lifetime of one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    pub started: Instant,
    pub method: Method,
    pub path: String,
    pub client_ip: Option<IpAddr>,
    pub user: Option<AuthenticatedUser>,
    pub response_state: ResponseState,
}

impl RequestContext {
    pub fn new(method: Method, path: &str, client_ip: Option<IpAddr>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            started: Instant::now(),
            method,
            path: path.to_string(),
            client_ip,
            user: None,
            response_state: ResponseState::default(),
        }
    }

    /// Key used by the rate limiters.
    pub fn client_key(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Whether a terminal response has already been produced for a request.
///
/// Shared between clones of the same [`RequestContext`]; only the first
/// [`commit`](Self::commit) succeeds.
#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    committed: Arc<AtomicBool>,
}

impl ResponseState {
    /// Claim the right to write the response. Returns `false` if it was
    /// already claimed.
    pub fn commit(&self) -> bool {
        !self.committed.swap(true, Ordering::AcqRel)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }
}
