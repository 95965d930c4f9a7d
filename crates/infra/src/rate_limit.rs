//! Per-identity admission control with named quota presets.
//!
//! ## Algorithm
//!
//! Fixed window per `(Identity, RatePreset)`:
//! - no window, or the window has elapsed: open a new window with count 1
//! - otherwise admit while `count < max_requests`, incrementing
//! - a denial never increments, so retrying inside a closed window costs nothing
//!
//! All windows live behind one `Mutex`, which makes check-and-increment
//! atomic for concurrent callers sharing an identity. Admission never
//! suspends.
//!
//! Elapsed windows are only dropped by [`RateLimiter::purge_expired`]; run
//! [`RateLimiter::spawn_sweeper`] so that one-off callers do not accumulate.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use opsflow_core::{TenantId, UserId};

/// Named quota.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatePreset {
    /// Price-list / file uploads.
    Upload,
    /// Price-list extraction calls.
    Extract,
    /// Extraction previews.
    Preview,
    /// Importing extracted rows into the catalog.
    Import,
    /// Everything without a dedicated quota.
    GenericApi,
    /// Per-item AI categorisation calls made by batch jobs.
    Classify,
}

impl RatePreset {
    pub const ALL: [RatePreset; 6] = [
        RatePreset::Upload,
        RatePreset::Extract,
        RatePreset::Preview,
        RatePreset::Import,
        RatePreset::GenericApi,
        RatePreset::Classify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RatePreset::Upload => "upload",
            RatePreset::Extract => "extract",
            RatePreset::Preview => "preview",
            RatePreset::Import => "import",
            RatePreset::GenericApi => "generic_api",
            RatePreset::Classify => "classify",
        }
    }

    /// Upper-case name used in `RATE_LIMIT_<NAME>_*` environment variables.
    pub fn env_name(&self) -> &'static str {
        match self {
            RatePreset::Upload => "UPLOAD",
            RatePreset::Extract => "EXTRACT",
            RatePreset::Preview => "PREVIEW",
            RatePreset::Import => "IMPORT",
            RatePreset::GenericApi => "GENERIC_API",
            RatePreset::Classify => "CLASSIFY",
        }
    }

    /// Built-in limits. Uploads and imports are the costliest and the strictest.
    pub fn default_limits(&self) -> PresetLimits {
        let minute = Duration::from_secs(60);
        match self {
            RatePreset::Upload => PresetLimits::new(10, minute),
            RatePreset::Extract => PresetLimits::new(30, minute),
            RatePreset::Preview => PresetLimits::new(120, minute),
            RatePreset::Import => PresetLimits::new(5, minute),
            RatePreset::GenericApi => PresetLimits::new(100, minute),
            RatePreset::Classify => PresetLimits::new(600, minute),
        }
    }
}

impl fmt::Display for RatePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `max_requests` per `window`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetLimits {
    pub max_requests: u32,
    pub window: Duration,
}

impl PresetLimits {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Limits for every preset.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    limits: HashMap<RatePreset, PresetLimits>,
    /// How often the sweeper drops elapsed windows
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limits: RatePreset::ALL
                .iter()
                .map(|p| (*p, p.default_limits()))
                .collect(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_limit(mut self, preset: RatePreset, limits: PresetLimits) -> Self {
        self.limits.insert(preset, limits);
        self
    }

    pub fn limits(&self, preset: RatePreset) -> PresetLimits {
        self.limits
            .get(&preset)
            .copied()
            .unwrap_or_else(|| preset.default_limits())
    }
}

/// Resolved caller key partitioning rate-limit budgets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Identity {
    Tenant(String),
    User(String),
    Address(IpAddr),
    Unknown,
}

impl Identity {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self::Tenant(tenant_id.to_string())
    }

    pub fn user(user_id: UserId) -> Self {
        Self::User(user_id.to_string())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Tenant(t) => write!(f, "tenant:{t}"),
            Identity::User(u) => write!(f, "user:{u}"),
            Identity::Address(a) => write!(f, "ip:{a}"),
            Identity::Unknown => f.write_str("unknown"),
        }
    }
}

/// What is known about the caller of one operation.
///
/// Resolve once per operation with [`CallerContext::identity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub tenant: Option<String>,
    pub user: Option<String>,
    pub address: Option<IpAddr>,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Fallback chain: tenant, then user, then network address, then `unknown`.
    /// Blank identifiers count as absent.
    pub fn identity(&self) -> Identity {
        fn present(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }

        if let Some(t) = present(&self.tenant) {
            return Identity::Tenant(t);
        }
        if let Some(u) = present(&self.user) {
            return Identity::User(u);
        }
        match self.address {
            Some(addr) => Identity::Address(addr),
            None => Identity::Unknown,
        }
    }
}

/// Admission decision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Allowed { remaining: u32 },
    /// Rate limited; the current window closes after `retry_after`.
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    started_at: Instant,
    count: u32,
}

impl RateLimitWindow {
    fn is_active(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.started_at) < window
    }
}

/// In-process rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(Identity, RatePreset), RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self, preset: RatePreset) -> PresetLimits {
        self.config.limits(preset)
    }

    pub fn admit(&self, identity: &Identity, preset: RatePreset) -> Admission {
        self.admit_at(identity, preset, Instant::now())
    }

    /// [`RateLimiter::admit`] against an explicit clock reading.
    pub fn admit_at(&self, identity: &Identity, preset: RatePreset, now: Instant) -> Admission {
        let limits = self.config.limits(preset);
        let mut windows = self.windows.lock().unwrap();
        let key = (identity.clone(), preset);

        if let Some(w) = windows.get_mut(&key) {
            if w.is_active(now, limits.window) {
                if w.count >= limits.max_requests {
                    let elapsed = now.saturating_duration_since(w.started_at);
                    let retry_after = limits.window.saturating_sub(elapsed);
                    debug!(identity = %identity, preset = %preset, ?retry_after, "rate limited");
                    return Admission::Denied { retry_after };
                }
                w.count += 1;
                return Admission::Allowed {
                    remaining: limits.max_requests - w.count,
                };
            }
        }

        if limits.max_requests == 0 {
            return Admission::Denied {
                retry_after: limits.window,
            };
        }

        windows.insert(
            key,
            RateLimitWindow {
                started_at: now,
                count: 1,
            },
        );
        Admission::Allowed {
            remaining: limits.max_requests - 1,
        }
    }

    /// Requests left in the current window.
    pub fn remaining(&self, identity: &Identity, preset: RatePreset) -> u32 {
        self.remaining_at(identity, preset, Instant::now())
    }

    pub fn remaining_at(&self, identity: &Identity, preset: RatePreset, now: Instant) -> u32 {
        let limits = self.config.limits(preset);
        let windows = self.windows.lock().unwrap();
        match windows.get(&(identity.clone(), preset)) {
            Some(w) if w.is_active(now, limits.window) => {
                limits.max_requests.saturating_sub(w.count)
            }
            _ => limits.max_requests,
        }
    }

    /// Drop elapsed windows; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap();
        let before = windows.len();
        let config = &self.config;
        windows.retain(|(_, preset), w| w.is_active(now, config.limits(*preset).window));
        before - windows.len()
    }

    /// Number of live windows (for diagnostics).
    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    /// Purge elapsed windows every `sweep_interval` until `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("rate-limit sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = limiter.purge_expired();
                        if purged > 0 {
                            let remaining = limiter.tracked_windows();
                            info!(purged, remaining, "elapsed rate-limit windows purged");
                        }
                    }
                }
            }
        })
    }
}
