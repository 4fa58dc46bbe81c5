//! Defense subsystem: per-IP rate limiting with temporary bans, a domain
//! blocklist, and a repeated-error log throttle.
//!
//! Every accepted request is screened with [`DefenseSystem::check_request`]
//! before any proxy work happens, on all dispatch branches. A background
//! sweeper purges expired windows, bans, and throttle entries.
//!
//! All clock-dependent methods have `_at` variants taking an explicit
//! `Instant` so the contracts are testable without sleeping.

use crate::config::DefenseConfig;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Domains abused against earlier deployments; blocked out of the box.
const KNOWN_ABUSER_DOMAINS: &[&str] = &[
    "hksjz.net",
    "btp3.app",
    "btbtptptpie.crxo5.com",
    "crxo5.com",
];

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// IP is serving out an earlier ban.
    Banned { remaining_mins: u64 },
    /// This request pushed the IP over the window limit.
    RateExceeded { ban_mins: u64 },
    /// Target hostname is on the blocklist.
    DomainBlocked { host: String },
}

impl Denial {
    /// HTTP status delivered to the client.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Denial::Banned { .. } | Denial::RateExceeded { .. } => 429,
            Denial::DomainBlocked { .. } => 403,
        }
    }

    /// Terse plain-text message for the client.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Denial::Banned { remaining_mins } => format!(
                "IP temporarily banned, about {} minute(s) remaining",
                remaining_mins
            ),
            Denial::RateExceeded { ban_mins } => format!(
                "request rate too high, IP banned for {} minutes",
                ban_mins
            ),
            Denial::DomainBlocked { host } => format!("domain {} is blocked", host),
        }
    }
}

struct WindowInfo {
    count: u32,
    started: Instant,
}

#[derive(Default)]
struct RateState {
    windows: HashMap<IpAddr, WindowInfo>,
    bans: HashMap<IpAddr, Instant>,
}

/// Fixed-window per-IP rate limiter with a temporary ban list.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    ban: Duration,
    state: Mutex<RateState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window_secs: u64, max_requests: u32, ban_mins: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs.max(1)),
            max_requests: max_requests.max(1),
            ban: Duration::from_secs(ban_mins.max(1) * 60),
            state: Mutex::new(RateState::default()),
        }
    }

    /// Record a request from `ip` and decide whether it may proceed.
    pub fn check_and_update(&self, ip: IpAddr) -> Result<(), Denial> {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), Denial> {
        let mut state = lock(&self.state);

        if let Some(&ban_until) = state.bans.get(&ip) {
            if now < ban_until {
                let remaining = ban_until - now;
                return Err(Denial::Banned {
                    remaining_mins: remaining.as_secs().div_ceil(60),
                });
            }
            state.bans.remove(&ip);
        }

        match state.windows.get_mut(&ip) {
            Some(info) if now.duration_since(info.started) <= self.window => {
                info.count += 1;
                if info.count > self.max_requests {
                    state.bans.insert(ip, now + self.ban);
                    return Err(Denial::RateExceeded {
                        ban_mins: self.ban.as_secs() / 60,
                    });
                }
            }
            _ => {
                state.windows.insert(
                    ip,
                    WindowInfo {
                        count: 1,
                        started: now,
                    },
                );
            }
        }
        Ok(())
    }

    fn sweep_at(&self, now: Instant) {
        let mut state = lock(&self.state);
        let window = self.window;
        state
            .windows
            .retain(|_, info| now.duration_since(info.started) <= window);
        state.bans.retain(|_, &mut until| now < until);
    }
}

/// Case-insensitive exact-match hostname blocklist.
pub struct DomainBlocklist {
    domains: Mutex<HashSet<String>>,
}

impl DomainBlocklist {
    /// Seed with the built-in abuser list plus any configured extras.
    #[must_use]
    pub fn new(extra: &[String]) -> Self {
        let mut domains: HashSet<String> = KNOWN_ABUSER_DOMAINS
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        for domain in extra {
            let domain = domain.trim().to_ascii_lowercase();
            if !domain.is_empty() {
                domains.insert(domain);
            }
        }
        Self {
            domains: Mutex::new(domains),
        }
    }

    #[must_use]
    pub fn is_blocked(&self, host: &str) -> bool {
        lock(&self.domains).contains(&host.to_ascii_lowercase())
    }

    pub fn block(&self, domain: &str) {
        let domain = domain.trim().to_ascii_lowercase();
        if !domain.is_empty() {
            lock(&self.domains).insert(domain);
        }
    }

    pub fn unblock(&self, domain: &str) {
        lock(&self.domains).remove(&domain.trim().to_ascii_lowercase());
    }

    #[must_use]
    pub fn blocked_domains(&self) -> Vec<String> {
        lock(&self.domains).iter().cloned().collect()
    }
}

struct ThrottleEntry {
    last_logged: Instant,
    error_count: u32,
}

/// Per-IP throttle for error-class log lines.
///
/// After `threshold` errors inside the window, further errors from that IP
/// are suppressed, except for one forced emission every quarter window so
/// monitoring stays alive.
pub struct LogSuppressor {
    window: Duration,
    threshold: u32,
    entries: Mutex<HashMap<IpAddr, ThrottleEntry>>,
}

impl LogSuppressor {
    #[must_use]
    pub fn new(window_secs: u64, threshold: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs.max(1)),
            threshold: threshold.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a log line for `ip` should be emitted.
    pub fn should_log(&self, ip: IpAddr, is_error: bool) -> bool {
        self.should_log_at(ip, is_error, Instant::now())
    }

    fn should_log_at(&self, ip: IpAddr, is_error: bool, now: Instant) -> bool {
        let mut entries = lock(&self.entries);

        if !is_error {
            entries
                .entry(ip)
                .and_modify(|e| e.last_logged = now)
                .or_insert(ThrottleEntry {
                    last_logged: now,
                    error_count: 0,
                });
            return true;
        }

        match entries.get_mut(&ip) {
            Some(entry) if now.duration_since(entry.last_logged) <= self.window => {
                entry.error_count += 1;
                if entry.error_count > self.threshold {
                    // Force one emission per quarter window for liveness.
                    if now.duration_since(entry.last_logged) > self.window / 4 {
                        entry.last_logged = now;
                        return true;
                    }
                    return false;
                }
                entry.last_logged = now;
                true
            }
            _ => {
                entries.insert(
                    ip,
                    ThrottleEntry {
                        last_logged: now,
                        error_count: 1,
                    },
                );
                true
            }
        }
    }

    fn sweep_at(&self, now: Instant) {
        let horizon = self.window * 2;
        lock(&self.entries)
            .retain(|_, entry| now.duration_since(entry.last_logged) <= horizon);
    }
}

/// The composed defense system. Each subcomponent honors its own toggle.
pub struct DefenseSystem {
    config: DefenseConfig,
    rate: RateLimiter,
    domains: DomainBlocklist,
    throttle: LogSuppressor,
}

impl DefenseSystem {
    #[must_use]
    pub fn new(config: DefenseConfig) -> Self {
        let rate = RateLimiter::new(
            config.rate_limit_window,
            config.max_requests_per_window,
            config.blacklist_timeout,
        );
        let domains = DomainBlocklist::new(&config.domain_blacklist);
        let throttle = LogSuppressor::new(
            config.log_suppression_window,
            config.log_suppression_threshold,
        );
        info!(
            rate_limit = config.enable_rate_limit,
            domain_block = config.enable_domain_block,
            log_suppression = config.enable_log_suppression,
            blocked_domains = domains.blocked_domains().len(),
            "defense system ready"
        );
        Self {
            config,
            rate,
            domains,
            throttle,
        }
    }

    /// Screen a request: blocklist first, then the rate limiter.
    pub fn check_request(&self, ip: IpAddr, host: &str) -> Result<(), Denial> {
        if self.config.enable_domain_block && !host.is_empty() && self.domains.is_blocked(host) {
            return Err(Denial::DomainBlocked {
                host: host.to_string(),
            });
        }
        if self.config.enable_rate_limit {
            self.rate.check_and_update(ip)?;
        }
        Ok(())
    }

    /// Gate for error-class log emission; informational lines always pass.
    pub fn should_log(&self, ip: IpAddr, is_error: bool) -> bool {
        if !self.config.enable_log_suppression {
            return true;
        }
        self.throttle.should_log(ip, is_error)
    }

    pub fn block_domain(&self, domain: &str) {
        self.domains.block(domain);
    }

    pub fn unblock_domain(&self, domain: &str) {
        self.domains.unblock(domain);
    }

    #[must_use]
    pub fn blocked_domains(&self) -> Vec<String> {
        self.domains.blocked_domains()
    }

    /// Run the periodic sweeper until the shutdown channel fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.rate_limit_window.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.rate.sweep_at(now);
                    self.throttle.sweep_at(now);
                    debug!("defense sweeper pass complete");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("defense sweeper stopping");
                        return;
                    }
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
