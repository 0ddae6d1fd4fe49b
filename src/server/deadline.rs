//! Call deadlines.

use std::time::Duration;
use tokio::time::Instant;

/// Header carrying the caller's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value: at most 8 digits followed by one of
/// `H`, `M`, `S`, `m`, `u`, `n`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 60 * 60)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Timer bounding one dispatched handler.
///
/// A disarmed guard never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineGuard {
    Disarmed,
    Armed(Instant),
}

impl DeadlineGuard {
    pub fn new(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => DeadlineGuard::Armed(Instant::now() + timeout),
            None => DeadlineGuard::Disarmed,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            DeadlineGuard::Armed(at) => Some(*at),
            DeadlineGuard::Disarmed => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, DeadlineGuard::Armed(_))
    }

    /// Resolves once the deadline passes.
    pub async fn expired(&self) {
        match self {
            DeadlineGuard::Armed(at) => tokio::time::sleep_until(*at).await,
            DeadlineGuard::Disarmed => std::future::pending().await,
        }
    }
}
