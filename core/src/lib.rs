//! Core types shared across the scan engine: jobs, results, errors.

pub mod error;
pub mod job;
pub mod ratelimiter;
pub mod result;

pub use error::{EngineError, ErrorKind, JobError};
pub use job::{JobId, JobState, NewJob, OwnerId, ScanJob};
pub use result::{Finding, ScanResult, ScanStatus, Severity};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn clip_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip_utf8("hello", 10), "hello");
        assert_eq!(clip_utf8("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off to the previous boundary
        assert_eq!(clip_utf8("aé", 2), "a");
        assert_eq!(clip_utf8("", 0), "");
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
