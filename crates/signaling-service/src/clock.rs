//! Wall-clock helpers. Presence and heartbeat timestamps are unix seconds.

use chrono::Utc;

/// Current unix time in seconds. Clamps pre-epoch clocks to zero.
#[must_use]
pub fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_recent() {
        // 2023-11-14
        assert!(unix_now() > 1_700_000_000);
    }
}
