// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Runtime configuration for the federation broker core.
///
/// Every field here corresponds to a named knob in the design document;
/// defaults mirror what a freshly started homeserver would ship with.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Idle-disconnect threshold: a Link with no in-flight write/read
    /// activity for this long is closed.
    #[serde(with = "serde_millis")]
    pub async_timeout: Duration,

    /// Maximum end-to-end time allotted to a single Tag from submit to
    /// promise fulfillment.
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,

    /// Size of the receive-side head buffer (AWAIT_HEAD state).
    pub header_max_size: usize,

    /// Per-peer link bounds.
    pub link_min_default: usize,
    /// Per-peer link bounds (absolute cap is `Peer::LINK_MAX_HARD`).
    pub link_max_default: usize,

    /// Per-link queue bound (total Tags, committed or not).
    pub tag_max_default: usize,
    /// Per-link bound on simultaneously committed (in-flight) Tags.
    pub tag_commit_max_default: usize,

    /// Cooldown window during which a Peer's error slot gates new submits.
    #[serde(with = "serde_millis")]
    pub error_clear_default: Duration,

    /// Whether AAAA records are considered during resolution fallback.
    pub enable_ipv6: bool,

    /// Defaults applied to a Request's option bundle when not overridden
    /// per-request.
    pub request_defaults: RequestDefaults,

    /// DNS resolver behavior.
    pub resolver: ResolverConfig,
}

/// Per-request options (§3, §6); these are the defaults a `Request`
/// inherits unless it overrides them explicitly.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct RequestDefaults {
    /// Whether a response status >= 300 is surfaced as `BrokerError::Http`.
    pub http_exceptions: bool,
    /// Cap on dynamically-allocated content size.
    pub content_length_maxalloc: usize,
    /// Whether chunked bodies are concatenated into one buffer on
    /// completion.
    pub contiguous_content: bool,
    /// Initial capacity hint for the chunk vector when not contiguous.
    pub chunks_reserve: usize,
    /// Whether overflow content is drained (not buffered) rather than
    /// failing the Tag with `BufferOverrun`.
    pub truncate_content: bool,
    /// Scheduling priority; `i16::MIN` requests a dedicated over-cap link
    /// (see `Peer::select_link`).
    pub priority: i16,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            http_exceptions: true,
            content_length_maxalloc: 16 * 1024 * 1024,
            contiguous_content: true,
            chunks_reserve: 8,
            truncate_content: false,
            priority: 0,
        }
    }
}

/// DNS resolution retry/backoff policy (§4.2).
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    /// Number of retries on timeout before giving up.
    pub retries: u32,
    /// Initial backoff before the first retry; doubles each attempt.
    #[serde(with = "serde_millis")]
    pub backoff_initial: Duration,
    /// Per-attempt bound on a single SRV/A/AAAA lookup before it counts as
    /// a timeout and is retried.
    #[serde(with = "serde_millis")]
    pub lookup_timeout: Duration,
    /// TTL floor applied to records that report a TTL of zero.
    pub min_ttl_secs: u64,
    /// Whether AAAA records are considered during resolution fallback.
    /// Mirrored from `Config::enable_ipv6` by `Dispatcher::new`.
    pub enable_ipv6: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_initial: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(5),
            min_ttl_secs: 1,
            enable_ipv6: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
            header_max_size: 16 * 1024,
            link_min_default: 1,
            link_max_default: 4,
            tag_max_default: 32,
            tag_commit_max_default: 8,
            error_clear_default: Duration::from_secs(30),
            enable_ipv6: true,
            request_defaults: RequestDefaults::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

/// Hard, non-negotiable ceiling on links per Peer (spec §6).
pub const LINK_MAX_HARD: usize = 16;

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and clamps derived fields into range.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.link_min_default >= 1, "link_min_default must be >= 1");
        ensure!(
            self.link_max_default >= self.link_min_default,
            "link_max_default must be >= link_min_default"
        );
        if self.link_max_default > LINK_MAX_HARD {
            self.link_max_default = LINK_MAX_HARD;
        }

        ensure!(self.tag_max_default >= 1, "tag_max_default must be >= 1");
        ensure!(
            self.tag_commit_max_default >= 1,
            "tag_commit_max_default must be >= 1"
        );
        ensure!(
            self.tag_commit_max_default <= self.tag_max_default,
            "tag_commit_max_default must be <= tag_max_default"
        );

        ensure!(self.header_max_size >= 256, "header_max_size too small");
        ensure!(
            self.request_defaults.content_length_maxalloc > 0,
            "content_length_maxalloc must be > 0"
        );

        // `enable_ipv6` is a root-level knob for ergonomics but resolution
        // itself only consults `resolver.enable_ipv6`; keep them in sync.
        self.resolver.enable_ipv6 = self.enable_ipv6;

        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let mut cfg = Config::default();
        cfg.validate_and_normalize().expect("defaults must validate");
    }

    #[test]
    fn link_max_is_clamped_to_hard_cap() {
        let mut cfg = Config {
            link_max_default: 9000,
            ..Config::default()
        };
        cfg.validate_and_normalize().expect("should normalize");
        assert_eq!(cfg.link_max_default, LINK_MAX_HARD);
    }

    #[test]
    fn tag_commit_max_above_tag_max_is_rejected() {
        let mut cfg = Config {
            tag_max_default: 2,
            tag_commit_max_default: 4,
            ..Config::default()
        };
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn resolver_retry_defaults_are_sane() {
        let resolver = ResolverConfig::default();
        assert_eq!(resolver.retries, 2);
        assert_eq!(resolver.backoff_initial, Duration::from_millis(200));
        assert!(resolver.lookup_timeout > resolver.backoff_initial);
    }

    #[test]
    fn roundtrips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).expect("serialize");
        let back: Config = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(cfg.link_max_default, back.link_max_default);
        assert_eq!(cfg.tag_max_default, back.tag_max_default);
    }
}
