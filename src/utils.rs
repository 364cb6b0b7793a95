// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! Small helpers shared across the broker core that don't belong to any
//! single component.

use std::time::Duration;

/// Computes the backoff before retry attempt `attempt` (0-based), doubling
/// `initial` each time (spec §4.2, `ResolverConfig::backoff_initial`).
pub fn exponential_backoff(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// Truncates a diagnostic byte buffer to at most `max` bytes, for
/// attaching response bodies to `BrokerError::Http` without retaining
/// unbounded memory.
pub fn truncate_for_diagnostics(buf: &[u8], max: usize) -> Vec<u8> {
    if buf.len() <= max {
        buf.to_vec()
    } else {
        buf[..max].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let initial = Duration::from_millis(200);
        assert_eq!(exponential_backoff(initial, 0), Duration::from_millis(200));
        assert_eq!(exponential_backoff(initial, 1), Duration::from_millis(400));
        assert_eq!(exponential_backoff(initial, 2), Duration::from_millis(800));
    }

    #[test]
    fn truncate_leaves_short_buffers_alone() {
        let buf = vec![1, 2, 3];
        assert_eq!(truncate_for_diagnostics(&buf, 10), buf);
    }

    #[test]
    fn truncate_clips_long_buffers() {
        let buf = vec![0u8; 100];
        assert_eq!(truncate_for_diagnostics(&buf, 10).len(), 10);
    }
}
