//! Response plumbing: status phrases and the cached Date header.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// The standard reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Format unix seconds as an RFC 7231 IMF-fixdate.
pub fn imf_date(secs: u64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp(i64::try_from(secs).unwrap_or(0), 0)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is representable"));
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Per-second cache for the Date header.  Double-checked on the coarse
/// clock: the common case is a relaxed load plus a read lock.
pub struct DateCache {
    second: AtomicU64,
    value: RwLock<String>,
}

impl DateCache {
    pub const fn new() -> Self {
        DateCache {
            second: AtomicU64::new(0),
            value: RwLock::new(String::new()),
        }
    }

    pub fn get(&self, now_secs: u64) -> String {
        if self.second.load(Ordering::Relaxed) == now_secs {
            return self.value.read().clone();
        }
        let formatted = imf_date(now_secs);
        let mut value = self.value.write();
        // Another writer may have won; newest second sticks.
        if self.second.swap(now_secs, Ordering::Relaxed) != now_secs {
            *value = formatted.clone();
        }
        formatted
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

static DATE_CACHE: DateCache = DateCache::new();

/// The shared Date header value for `now_secs`.
pub fn cached_date(now_secs: u64) -> String {
    DATE_CACHE.get(now_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imf_fixdate_formatting() {
        // 2015-10-21 07:28:00 UTC
        assert_eq!(imf_date(1_445_412_480), "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(imf_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn date_cache_returns_consistent_value_per_second() {
        let cache = DateCache::new();
        let a = cache.get(1_445_412_480);
        let b = cache.get(1_445_412_480);
        assert_eq!(a, b);
        let c = cache.get(1_445_412_481);
        assert_ne!(a, c);
    }

    #[test]
    fn common_status_phrases() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(999), "Unknown");
    }
}
