use chrono::DateTime;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Wall clock corrected toward the server's notion of time.
///
/// Encrypted payloads carry a timestamp that is checked against a two
/// minute window, so a device with a skewed clock has to learn the offset
/// from the server before it can decrypt anything.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        local_now_ms() + self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn observe_server_time_ms(&self, server_ms: i64) {
        self.offset_ms
            .store(server_ms - local_now_ms(), Ordering::Relaxed);
    }

    /// Learns the offset from an HTTP `Date` header. Second precision only, so
    /// offsets under a second are ignored to avoid jitter.
    pub fn observe_http_date(&self, header: &str) {
        let Ok(parsed) = DateTime::parse_from_rfc2822(header) else {
            return;
        };
        let server_ms = parsed.timestamp_millis();
        let candidate = server_ms - local_now_ms();
        if (candidate - self.offset_ms()).abs() >= 1000 {
            log::debug!("[clock] server offset now {}ms", candidate);
            self.offset_ms.store(candidate, Ordering::Relaxed);
        }
    }
}
