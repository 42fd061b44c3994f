//! Per-connection streaming session: rate limiting, request dispatch into
//! the Stage Orchestrator, and event relay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::CouncilError;

/// Identifies a client for rate-limiting purposes: the SHA-256 prefix of
/// the forwarded client IP, never the raw address.
pub fn client_identity(forwarded_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(forwarded_ip.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

struct ClientWindow {
    request_timestamps: Vec<Instant>,
    open_connections: u32,
    hourly_cost_usd: f64,
    hour_started: Instant,
}

impl ClientWindow {
    fn new(now: Instant) -> Self {
        ClientWindow {
            request_timestamps: Vec::new(),
            open_connections: 0,
            hourly_cost_usd: 0.0,
            hour_started: now,
        }
    }
}

/// Per-client concurrent-connection cap, per-window request cap, and
/// per-hour cost ceiling, matching §4.8's limiter defaults.
pub struct RateLimiter {
    max_concurrent_connections: u32,
    max_requests_per_window: u32,
    window: Duration,
    hourly_cost_ceiling_usd: f64,
    clients: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
    pub fn new(
        max_concurrent_connections: u32,
        max_requests_per_window: u32,
        window: Duration,
        hourly_cost_ceiling_usd: f64,
    ) -> Self {
        RateLimiter {
            max_concurrent_connections,
            max_requests_per_window,
            window,
            hourly_cost_ceiling_usd,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Called on connection setup. Registers an open connection for
    /// `client_id`, rejecting if the concurrent-connection cap is exceeded.
    pub fn acquire_connection(&self, client_id: &str) -> Result<(), CouncilError> {
        let mut clients = self.clients.lock().expect("rate limiter mutex poisoned");
        let window = clients.entry(client_id.to_string()).or_insert_with(|| ClientWindow::new(Instant::now()));
        if window.open_connections >= self.max_concurrent_connections {
            return Err(CouncilError::ConnectionLimitClient);
        }
        window.open_connections += 1;
        Ok(())
    }

    pub fn release_connection(&self, client_id: &str) {
        let mut clients = self.clients.lock().expect("rate limiter mutex poisoned");
        if let Some(window) = clients.get_mut(client_id) {
            window.open_connections = window.open_connections.saturating_sub(1);
        }
    }

    /// Called for each `execute` request. Rejects once the per-window
    /// request cap or hourly cost ceiling is exceeded.
    pub fn check_request(&self, client_id: &str) -> Result<(), CouncilError> {
        let mut clients = self.clients.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let window_duration = self.window;
        let window = clients.entry(client_id.to_string()).or_insert_with(|| ClientWindow::new(now));

        window.request_timestamps.retain(|t| now.duration_since(*t) < window_duration);
        if window.request_timestamps.len() as u32 >= self.max_requests_per_window {
            return Err(CouncilError::RateLimitClient);
        }
        window.request_timestamps.push(now);

        if now.duration_since(window.hour_started) >= Duration::from_secs(3600) {
            window.hourly_cost_usd = 0.0;
            window.hour_started = now;
        }
        if window.hourly_cost_usd >= self.hourly_cost_ceiling_usd {
            return Err(CouncilError::RateLimitClient);
        }

        Ok(())
    }

    pub fn record_cost(&self, client_id: &str, cost_usd: f64) {
        let mut clients = self.clients.lock().expect("rate limiter mutex poisoned");
        if let Some(window) = clients.get_mut(client_id) {
            window.hourly_cost_usd += cost_usd;
        }
    }
}
