//! Per-stream access records.

use crate::logging::ACCESS_LOG_TARGET;
use parking_lot::Mutex;
use std::time::Duration;
use tonic::Code;
use tracing::{info, warn};

/// Placeholder for header values the caller did not send.
pub const ABSENT: &str = "?";

/// The outcome of one stream, written exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub host: String,
    pub method: String,
    pub path: String,
    pub http_status: u16,
    /// Missing when the stream ended without trailers
    pub grpc_status: Option<Code>,
    pub request_service: String,
    pub correlation_id: String,
    pub stream_id: u64,
    pub deadline: Option<Duration>,
    pub message: Option<String>,
    /// Server-side error detail; never sent to the caller
    pub detail: Option<String>,
}

/// Destination for access records.
pub trait AccessLogSink: Send + Sync {
    fn record(&self, record: &AccessRecord);
}

/// Writes records through `tracing` on the access target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn record(&self, record: &AccessRecord) {
        let grpc_status = record.grpc_status.map(|code| code as i32);
        let deadline = record.deadline.map(|d| d.as_secs_f64());
        let message = record.message.as_deref().unwrap_or("");

        match &record.detail {
            Some(detail) => warn!(
                target: ACCESS_LOG_TARGET,
                host = %record.host,
                method = %record.method,
                path = %record.path,
                http_status = record.http_status,
                grpc_status = ?grpc_status,
                request_service = %record.request_service,
                correlation_id = %record.correlation_id,
                stream_id = record.stream_id,
                deadline = ?deadline,
                detail = %detail,
                "{}", message
            ),
            None => info!(
                target: ACCESS_LOG_TARGET,
                host = %record.host,
                method = %record.method,
                path = %record.path,
                http_status = record.http_status,
                grpc_status = ?grpc_status,
                request_service = %record.request_service,
                correlation_id = %record.correlation_id,
                stream_id = record.stream_id,
                deadline = ?deadline,
                "{}", message
            ),
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAccessLog {
    records: Mutex<Vec<AccessRecord>>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccessRecord> {
        self.records.lock().clone()
    }

    pub fn last(&self) -> Option<AccessRecord> {
        self.records.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AccessLogSink for MemoryAccessLog {
    fn record(&self, record: &AccessRecord) {
        self.records.lock().push(record.clone());
    }
}
