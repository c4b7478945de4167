//! Host reputation and automatic bans
//!
//! Every authentication failure or limit violation adds a weighted event to
//! the remote host's record. Events older than the observation window are
//! dropped lazily whenever the record is touched. Once the summed score
//! reaches the threshold the host is banned; a host banned again before its
//! record has decayed gets twice the previous duration, up to the
//! configured ceiling.
//!
//! Records live in a sharded map so updates for one host are serialized by
//! its shard lock without blocking unrelated hosts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::config::DefenderConfig;
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Scored event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    /// Wrong credentials for an existing user
    LoginFailed,
    /// Login attempt for an unknown user
    NoSuchUser,
    /// Client disconnected without attempting to log in
    NoLoginTried,
    /// Client exceeded a rate or connection limit
    LimitExceeded,
}

impl HostEvent {
    const fn weight(self, config: &DefenderConfig) -> u32 {
        match self {
            Self::LoginFailed => config.score_login_failed,
            Self::NoSuchUser => config.score_no_such_user,
            Self::NoLoginTried => config.score_no_login_tried,
            Self::LimitExceeded => config.score_limit_exceeded,
        }
    }
}

/// Operator view of a tracked host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenderEntry {
    /// Remote host
    pub host: IpAddr,
    /// Score inside the current observation window
    pub score: u32,
    /// End of the active ban, if any
    pub banned_until: Option<DateTime<Utc>>,
}

/// Operator-issued ban or unban, persisted as JSON
///
/// A ban runs until `banned_until`; once that has passed the entry is
/// ignored. An entry without `banned_until` is an unban, applied once: it
/// lifts whatever the host has accumulated up to `issued_at`, and is
/// skipped by later loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOverride {
    /// Remote host
    pub host: IpAddr,
    /// Ban expiry
    #[serde(default)]
    pub banned_until: Option<DateTime<Utc>>,
    /// When the operator issued the entry
    #[serde(default)]
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HostRecord {
    events: VecDeque<(Instant, u32)>,
    banned_until: Option<Instant>,
    next_ban: Duration,
    last_update: Instant,
}

impl HostRecord {
    const fn new(first_ban: Duration, now: Instant) -> Self {
        Self {
            events: VecDeque::new(),
            banned_until: None,
            next_ban: first_ban,
            last_update: now,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.events.front() {
            if now.saturating_duration_since(at) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.banned_until.is_some_and(|until| until <= now) {
            self.banned_until = None;
        }
    }

    fn score(&self) -> u32 {
        self.events
            .iter()
            .fold(0u32, |acc, (_, weight)| acc.saturating_add(*weight))
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    fn is_idle(&self) -> bool {
        self.events.is_empty() && self.banned_until.is_none()
    }
}

/// Process-wide scoring table
#[derive(Debug)]
pub struct Defender {
    config: DefenderConfig,
    hosts: DashMap<IpAddr, HostRecord>,
    metrics: Metrics,
    overrides_applied_at: Mutex<Option<DateTime<Utc>>>,
}

impl Defender {
    /// Create a defender with its own metrics
    pub fn new(config: DefenderConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    /// Create a defender reporting into shared metrics
    pub fn with_metrics(config: DefenderConfig, metrics: Metrics) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
            metrics,
            overrides_applied_at: Mutex::new(None),
        }
    }

    /// Defender configuration
    pub const fn config(&self) -> &DefenderConfig {
        &self.config
    }

    fn is_safelisted(&self, host: &IpAddr) -> bool {
        self.config.safelist.contains(host)
    }

    /// Check whether a host is currently banned
    ///
    /// Safelisted hosts are never banned. Expired events are pruned here
    /// and a record with nothing left in it is dropped.
    pub fn is_banned(&self, host: IpAddr) -> bool {
        if self.is_safelisted(&host) {
            return false;
        }

        let now = Instant::now();
        let window = self.config.observation_window();
        let (banned, idle) = match self.hosts.get_mut(&host) {
            Some(mut record) => {
                record.prune(now, window);
                (record.is_banned(now), record.is_idle())
            }
            None => return false,
        };

        if idle {
            self.hosts.remove_if(&host, |_, record| record.is_idle());
        }
        banned
    }

    /// Score an event against a host
    ///
    /// Returns `true` when this event banned the host. Events from a host
    /// that is already banned are ignored.
    pub fn add_event(&self, host: IpAddr, event: HostEvent) -> bool {
        if !self.config.enabled || self.is_safelisted(&host) {
            return false;
        }
        let weight = event.weight(&self.config);
        if weight == 0 {
            return false;
        }

        let now = Instant::now();
        let window = self.config.observation_window();
        let mut inserted = false;

        let outcome = {
            let mut record = self.hosts.entry(host).or_insert_with(|| {
                inserted = true;
                HostRecord::new(self.config.ban_duration(), now)
            });
            record.prune(now, window);
            record.last_update = now;
            if record.is_idle() {
                record.next_ban = self.config.ban_duration();
            }

            if record.is_banned(now) {
                None
            } else {
                record.events.push_back((now, weight));
                let score = record.score();
                if score >= self.config.ban_threshold {
                    let duration = record.next_ban;
                    record.banned_until = Some(now + duration);
                    record.next_ban = duration
                        .saturating_mul(2)
                        .min(self.config.max_ban_duration())
                        .max(duration);
                    Some((true, score, duration))
                } else {
                    Some((false, score, Duration::ZERO))
                }
            }
        };

        if inserted {
            self.enforce_limits();
        }

        match outcome {
            Some((true, score, duration)) => {
                self.metrics.record_ban();
                AuditEvent::HostBanned {
                    client_ip: host,
                    score,
                    duration_secs: duration.as_secs(),
                    timestamp: Utc::now(),
                }
                .log();
                true
            }
            Some((false, score, _)) => {
                debug!(host = %host, event = ?event, score, "Defender event scored");
                false
            }
            None => false,
        }
    }

    /// Ban a host for a fixed duration, outside the scoring rules
    ///
    /// An active ban that ends later is kept. Returns `false` for
    /// safelisted hosts, which cannot be banned.
    pub fn ban_host(&self, host: IpAddr, duration: Duration) -> bool {
        if self.is_safelisted(&host) {
            warn!(host = %host, "Refusing to ban a safelisted host");
            return false;
        }

        let now = Instant::now();
        let mut inserted = false;
        {
            let mut record = self.hosts.entry(host).or_insert_with(|| {
                inserted = true;
                HostRecord::new(self.config.ban_duration(), now)
            });
            let until = now + duration;
            record.banned_until = Some(
                record
                    .banned_until
                    .filter(|current| *current > until)
                    .unwrap_or(until),
            );
            record.last_update = now;
        }
        if inserted {
            self.enforce_limits();
        }

        AuditEvent::HostBanned {
            client_ip: host,
            score: 0,
            duration_secs: duration.as_secs(),
            timestamp: Utc::now(),
        }
        .log();
        true
    }

    /// Forget a host entirely, lifting any ban
    ///
    /// Returns `true` if the host was tracked.
    pub fn delete_host(&self, host: IpAddr) -> bool {
        let removed = self.hosts.remove(&host).is_some();
        if removed {
            AuditEvent::HostUnbanned {
                client_ip: host,
                timestamp: Utc::now(),
            }
            .log();
        }
        removed
    }

    /// Every tracked host with a live score or ban
    pub fn get_hosts(&self) -> Vec<DefenderEntry> {
        let now = Instant::now();
        let window = self.config.observation_window();
        self.hosts.retain(|_, record| {
            record.prune(now, window);
            !record.is_idle()
        });

        let wall_now = Utc::now();
        let mut entries: Vec<DefenderEntry> = self
            .hosts
            .iter()
            .map(|item| to_entry(*item.key(), item.value(), now, wall_now))
            .collect();
        entries.sort_by_key(|entry| entry.host);
        entries
    }

    /// A single host, if it has a live score or ban
    pub fn get_host(&self, host: IpAddr) -> Option<DefenderEntry> {
        let now = Instant::now();
        let window = self.config.observation_window();
        let mut record = self.hosts.get_mut(&host)?;
        record.prune(now, window);
        if record.is_idle() {
            return None;
        }
        Some(to_entry(host, &record, now, Utc::now()))
    }

    /// Number of hosts in the table
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// True when no host is tracked
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Apply operator overrides
    ///
    /// Bans still running are (re)applied and expired ones ignored. Unbans
    /// take effect only if issued since the previous application, so
    /// reloading the same file never lifts a ban earned afterwards.
    /// Returns the number of hosts banned by the overrides.
    pub fn apply_overrides(&self, overrides: &[HostOverride]) -> usize {
        let mut applied_at = self
            .overrides_applied_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let wall_now = Utc::now();
        let mut banned = 0;
        for item in overrides {
            match item.banned_until {
                Some(until) => {
                    let remaining = (until - wall_now)
                        .to_std()
                        .ok()
                        .filter(|remaining| !remaining.is_zero());
                    if let Some(remaining) = remaining {
                        if self.ban_host(item.host, remaining) {
                            banned += 1;
                        }
                    }
                }
                None => {
                    if applied_at.is_none_or(|at| item.issued_at >= at) {
                        self.delete_host(item.host);
                    }
                }
            }
        }
        *applied_at = Some(wall_now);
        banned
    }

    /// Read and apply an overrides file
    ///
    /// # Errors
    ///
    /// `Error::Config` when the file exists but cannot be read or parsed
    pub fn load_overrides(&self, path: impl AsRef<Path>) -> Result<usize> {
        let overrides = read_overrides(path.as_ref())?;
        let banned = self.apply_overrides(&overrides);
        info!(
            path = %path.as_ref().display(),
            entries = overrides.len(),
            banned,
            "Defender overrides applied"
        );
        Ok(banned)
    }

    fn enforce_limits(&self) {
        let hard = self.config.entries_hard_limit;
        if hard == 0 || self.hosts.len() <= hard {
            return;
        }
        let soft = self.config.entries_soft_limit.min(hard);
        let now = Instant::now();

        // Unbanned hosts go first, oldest update first.
        let mut candidates: Vec<(bool, Instant, IpAddr)> = self
            .hosts
            .iter()
            .map(|item| (item.is_banned(now), item.last_update, *item.key()))
            .collect();
        candidates.sort_unstable();

        let excess = candidates.len().saturating_sub(soft);
        for (_, _, host) in candidates.into_iter().take(excess) {
            self.hosts.remove(&host);
        }
        debug!(
            dropped = excess,
            remaining = self.hosts.len(),
            "Defender table trimmed"
        );
    }
}

fn to_entry(host: IpAddr, record: &HostRecord, now: Instant, wall_now: DateTime<Utc>) -> DefenderEntry {
    let banned_until = record
        .banned_until
        .filter(|until| *until > now)
        .map(|until| {
            let remaining = chrono::Duration::from_std(until - now)
                .unwrap_or_else(|_| chrono::Duration::zero());
            wall_now + remaining
        });
    DefenderEntry {
        host,
        score: record.score(),
        banned_until,
    }
}

/// Read an overrides file; a missing file holds no overrides
///
/// # Errors
///
/// `Error::Config` when the file cannot be read or parsed
pub fn read_overrides(path: &Path) -> Result<Vec<HostOverride>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Config(format!(
                "Failed to read defender overrides {}: {}",
                path.display(),
                e
            )));
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse defender overrides {}: {}",
            path.display(),
            e
        ))
    })
}

/// Write an overrides file
///
/// # Errors
///
/// `Error::Config` when the file cannot be written
pub fn write_overrides(path: &Path, overrides: &[HostOverride]) -> Result<()> {
    let content = serde_json::to_string_pretty(overrides)
        .map_err(|e| Error::Config(format!("Failed to serialize defender overrides: {}", e)))?;
    std::fs::write(path, content).map_err(|e| {
        Error::Config(format!(
            "Failed to write defender overrides {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, weight: u32) -> DefenderConfig {
        DefenderConfig {
            ban_threshold: threshold,
            score_login_failed: weight,
            observation_window_secs: 300,
            ban_duration_secs: 60,
            max_ban_duration_secs: 150,
            ..DefenderConfig::default()
        }
    }

    fn host(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn test_ceil_threshold_over_weight_bans() {
        for (threshold, weight) in [(5, 1), (5, 2), (6, 3), (15, 4), (1, 1), (3, 5)] {
            let defender = Defender::new(config(threshold, weight));
            let needed = threshold.div_ceil(weight);
            let h = host(1);

            for _ in 0..needed - 1 {
                assert!(!defender.add_event(h, HostEvent::LoginFailed));
            }
            assert!(
                !defender.is_banned(h),
                "threshold {threshold} weight {weight}: banned too early"
            );
            assert!(defender.add_event(h, HostEvent::LoginFailed));
            assert!(defender.is_banned(h));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_ban_four_do_not() {
        let defender = Defender::new(config(5, 1));
        let banned = host(1);
        let other = host(6);

        for _ in 0..5 {
            defender.add_event(banned, HostEvent::LoginFailed);
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        for _ in 0..4 {
            defender.add_event(other, HostEvent::LoginFailed);
        }

        assert!(defender.is_banned(banned));
        assert!(!defender.is_banned(other));
        assert_eq!(defender.get_host(other).unwrap().score, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_decay_outside_window() {
        let defender = Defender::new(config(5, 1));
        let h = host(2);

        for _ in 0..4 {
            defender.add_event(h, HostEvent::LoginFailed);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!defender.add_event(h, HostEvent::LoginFailed));
        assert_eq!(defender.get_host(h).unwrap().score, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!defender.is_banned(h));
        assert!(defender.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires_and_escalates() {
        let defender = Defender::new(config(5, 1));
        let h = host(3);

        for _ in 0..5 {
            defender.add_event(h, HostEvent::LoginFailed);
        }
        assert!(defender.is_banned(h));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!defender.is_banned(h));

        // Score has not decayed, so one more failure re-bans for twice as long.
        assert!(defender.add_event(h, HostEvent::LoginFailed));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(defender.is_banned(h));
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!defender.is_banned(h));

        // Capped at the ceiling.
        assert!(defender.add_event(h, HostEvent::LoginFailed));
        tokio::time::advance(Duration::from_secs(149)).await;
        assert!(defender.is_banned(h));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!defender.is_banned(h));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_while_banned_are_ignored() {
        let defender = Defender::new(config(2, 1));
        let h = host(4);
        defender.add_event(h, HostEvent::LoginFailed);
        assert!(defender.add_event(h, HostEvent::LoginFailed));
        assert!(!defender.add_event(h, HostEvent::LoginFailed));
        assert_eq!(defender.get_host(h).unwrap().score, 2);
    }

    #[test]
    fn test_safelisted_host_is_never_scored() {
        let mut cfg = config(1, 1);
        cfg.safelist = vec![host(9)];
        let defender = Defender::new(cfg);

        assert!(!defender.add_event(host(9), HostEvent::LoginFailed));
        assert!(!defender.ban_host(host(9), Duration::from_secs(60)));
        assert!(!defender.is_banned(host(9)));
        assert!(defender.get_host(host(9)).is_none());
    }

    #[test]
    fn test_disabled_defender_keeps_manual_bans() {
        let mut cfg = config(1, 1);
        cfg.enabled = false;
        let defender = Defender::new(cfg);

        assert!(!defender.add_event(host(1), HostEvent::NoSuchUser));
        assert!(!defender.is_banned(host(1)));

        assert!(defender.ban_host(host(1), Duration::from_secs(60)));
        assert!(defender.is_banned(host(1)));
    }

    #[test]
    fn test_get_hosts_and_delete() {
        let defender = Defender::new(config(10, 1));
        defender.add_event(host(2), HostEvent::LoginFailed);
        defender.add_event(host(1), HostEvent::LoginFailed);
        defender.ban_host(host(3), Duration::from_secs(60));

        let hosts = defender.get_hosts();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].host, host(1));
        assert!(hosts[2].banned_until.is_some());
        assert!(hosts[0].banned_until.is_none());

        assert!(defender.delete_host(host(3)));
        assert!(!defender.delete_host(host(3)));
        assert!(!defender.is_banned(host(3)));
        assert_eq!(defender.get_hosts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_trimmed_to_soft_limit() {
        let mut cfg = config(10, 1);
        cfg.entries_soft_limit = 2;
        cfg.entries_hard_limit = 3;
        let defender = Defender::new(cfg);

        defender.ban_host(host(1), Duration::from_secs(600));
        for last in 2..=4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            defender.add_event(host(last), HostEvent::LoginFailed);
        }

        assert_eq!(defender.len(), 2);
        assert!(defender.is_banned(host(1)));
        assert!(defender.get_host(host(4)).is_some());
        assert!(defender.get_host(host(2)).is_none());
    }

    #[test]
    fn test_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        let defender = Defender::new(config(10, 1));
        defender.ban_host(host(2), Duration::from_secs(600));

        assert!(read_overrides(&path).unwrap().is_empty());

        let overrides = vec![
            HostOverride {
                host: host(1),
                banned_until: Some(Utc::now() + chrono::Duration::minutes(10)),
                issued_at: Utc::now(),
            },
            HostOverride {
                host: host(2),
                banned_until: None,
                issued_at: Utc::now(),
            },
        ];
        write_overrides(&path, &overrides).unwrap();

        assert_eq!(defender.load_overrides(&path).unwrap(), 1);
        assert!(defender.is_banned(host(1)));
        assert!(!defender.is_banned(host(2)));
    }

    #[test]
    fn test_malformed_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        std::fs::write(&path, "{ not json").unwrap();

        let defender = Defender::new(config(10, 1));
        assert!(matches!(defender.load_overrides(&path), Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decayed_host_starts_over_at_base_ban() {
        let defender = Defender::new(config(5, 1));
        let h = host(5);

        for _ in 0..5 {
            defender.add_event(h, HostEvent::LoginFailed);
        }
        assert!(defender.is_banned(h));

        // Ban over and every event out of the window.
        tokio::time::advance(Duration::from_secs(700)).await;

        for _ in 0..4 {
            assert!(!defender.add_event(h, HostEvent::LoginFailed));
        }
        assert!(defender.add_event(h, HostEvent::LoginFailed));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(defender.is_banned(h));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!defender.is_banned(h));
    }

    #[test]
    fn test_manual_ban_never_shortens_a_longer_one() {
        let defender = Defender::new(config(10, 1));
        let h = host(7);
        defender.ban_host(h, Duration::from_secs(3600));
        defender.ban_host(h, Duration::from_secs(60));

        let until = defender.get_host(h).unwrap().banned_until.unwrap();
        assert!(until > Utc::now() + chrono::Duration::minutes(30));
    }

    #[test]
    fn test_reapplied_overrides_keep_later_bans() {
        let defender = Defender::new(config(10, 1));
        let stale_ban = host(1);
        let unbanned = host(2);
        let issued = Utc::now() - chrono::Duration::hours(1);
        let overrides = vec![
            HostOverride {
                host: stale_ban,
                banned_until: Some(Utc::now() - chrono::Duration::minutes(5)),
                issued_at: issued,
            },
            HostOverride {
                host: unbanned,
                banned_until: None,
                issued_at: issued,
            },
        ];
        assert_eq!(defender.apply_overrides(&overrides), 0);

        // Both hosts earn a ban after the file was first applied.
        assert!(defender.ban_host(stale_ban, Duration::from_secs(600)));
        assert!(defender.ban_host(unbanned, Duration::from_secs(600)));

        assert_eq!(defender.apply_overrides(&overrides), 0);
        assert!(defender.is_banned(stale_ban));
        assert!(defender.is_banned(unbanned));

        // A fresh unban still goes through.
        let fresh = vec![HostOverride {
            host: unbanned,
            banned_until: None,
            issued_at: Utc::now(),
        }];
        defender.apply_overrides(&fresh);
        assert!(!defender.is_banned(unbanned));
        assert!(defender.is_banned(stale_ban));
    }
}
