//! Inbound request state machine.
//!
//! Every stream moves through validation, authentication and dispatch and ends
//! either completed or aborted. Validation and authentication failures are
//! answered immediately; dispatched handlers run in their own task under a
//! deadline guard while a driver task waits for the first of handler
//! completion, deadline expiry or peer termination. Each path ends in
//! [`CallContext::finish`], which writes the single access record for the
//! stream.

use super::access_log::{AccessLogSink, AccessRecord, ABSENT};
use super::deadline::{parse_grpc_timeout, DeadlineGuard, GRPC_TIMEOUT_HEADER};
use super::service::{ServerMethod, ServiceDefinition};
use super::stream::{ResponseFrame, ServerStream, StatusSlot};
use crate::auth::Authenticator;
use crate::client::CallerContext;
use crate::config::Settings;
use crate::error::{Abort, BoxError, CallError, ConfigurationError, ErrorCode, Result};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, TE};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::Code;
use tracing::{debug, error, info};

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Sent instead of the detail of a framing or decoding failure.
pub const PROTOCOL_ERROR_MESSAGE: &str = "Protocol error. This will need attention!";
/// Sent instead of the detail of an untyped handler failure.
pub const APPLICATION_ERROR_MESSAGE: &str = "Application error. This will need attention!";
pub const DEADLINE_EXCEEDED_MESSAGE: &str = "Deadline exceeded";
pub const CANCELLATION_FAILED_MESSAGE: &str = "Failed to handle cancellation";
pub const REQUEST_CANCELLED_MESSAGE: &str = "Request was cancelled";

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const DEFAULT_SUBTYPE: &str = "proto";
const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

/// Everything outside printable ASCII, plus `%` itself.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// Per-stream bookkeeping. Consumed by [`CallContext::finish`].
#[derive(Debug)]
pub struct CallContext {
    record: AccessRecord,
    correlation_id: Option<String>,
}

impl CallContext {
    fn new(stream_id: u64, parts: &Parts, request_service_header: &str, request_id_header: &str) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let host = parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| header("host"))
            .unwrap_or_else(|| ABSENT.to_string());
        let correlation_id = header(request_id_header);

        Self {
            record: AccessRecord {
                host,
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                http_status: 200,
                grpc_status: None,
                request_service: header(request_service_header).unwrap_or_else(|| ABSENT.to_string()),
                correlation_id: correlation_id.clone().unwrap_or_else(|| ABSENT.to_string()),
                stream_id,
                deadline: None,
                message: None,
                detail: None,
            },
            correlation_id,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.record.stream_id
    }

    /// Write the access record for this stream.
    pub fn finish(
        mut self,
        sink: &dyn AccessLogSink,
        http_status: u16,
        grpc_status: Option<Code>,
        message: Option<String>,
        detail: Option<String>,
    ) {
        self.record.http_status = http_status;
        self.record.grpc_status = grpc_status;
        self.record.message = message;
        self.record.detail = detail;
        sink.record(&self.record);
    }
}

/// How a dispatched stream ends.
#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    Trailers {
        code: Code,
        message: Option<String>,
        error_code: Option<ErrorCode>,
        detail: Option<String>,
    },
    /// The peer is gone; nothing is sent.
    Reset { detail: Option<String> },
}

/// State shared with per-stream driver tasks.
struct Shared {
    sink: Arc<dyn AccessLogSink>,
    cancel_grace: Duration,
    error_code_header: HeaderName,
}

impl Shared {
    fn status_headers(&self, code: Code, message: Option<&str>, error_code: Option<ErrorCode>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_STATUS, HeaderValue::from(code as i32));
        if let Some(message) = message {
            let encoded = utf8_percent_encode(message, GRPC_MESSAGE_ENCODE_SET).to_string();
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                headers.insert(GRPC_MESSAGE, value);
            }
        }
        if let Some(error_code) = error_code {
            headers.insert(self.error_code_header.clone(), HeaderValue::from(error_code.value()));
        }
        headers
    }
}

/// Validates, authenticates, dispatches and logs inbound streams.
pub struct RequestHandler {
    methods: HashMap<String, ServerMethod>,
    services: Vec<String>,
    authenticator: Authenticator,
    content_subtype: String,
    content_type: HeaderValue,
    max_message_size: usize,
    response_buffer: usize,
    request_service_header: String,
    request_id_header: String,
    stream_ids: AtomicU64,
    shared: Arc<Shared>,
}

impl RequestHandler {
    pub fn new(
        settings: &Settings,
        services: Vec<ServiceDefinition>,
        authenticator: Authenticator,
        sink: Arc<dyn AccessLogSink>,
    ) -> Result<Self> {
        let subtype = settings.server.content_subtype.clone();
        let content_type = HeaderValue::from_str(&format!("{}+{}", GRPC_CONTENT_TYPE, subtype))
            .map_err(|_| ConfigurationError::Invalid(format!("Invalid content subtype {:?}", subtype)))?;
        let error_code_header = HeaderName::from_bytes(settings.headers.error_code.to_lowercase().as_bytes())
            .map_err(|_| {
                ConfigurationError::Invalid(format!("Invalid error code header {:?}", settings.headers.error_code))
            })?;

        let mut methods = HashMap::new();
        let mut names = Vec::new();
        for service in services {
            names.push(service.name().to_string());
            for method in service.methods() {
                methods.insert(method.descriptor.path.clone(), method.clone());
            }
        }

        Ok(Self {
            methods,
            services: names,
            authenticator,
            content_subtype: subtype,
            content_type,
            max_message_size: settings.server.max_message_size,
            response_buffer: settings.server.response_buffer.max(1),
            request_service_header: settings.headers.request_service.to_lowercase(),
            request_id_header: settings.headers.request_id.to_lowercase(),
            stream_ids: AtomicU64::new(0),
            shared: Arc::new(Shared {
                sink,
                cancel_grace: settings.server.cancel_grace(),
                error_code_header,
            }),
        })
    }

    /// Names of the services this handler dispatches to.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Paths of every dispatchable method, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub async fn handle<B>(&self, request: Request<B>, remote_addr: Option<SocketAddr>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let stream_id = self.stream_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (parts, body) = request.into_parts();
        let mut ctx = CallContext::new(stream_id, &parts, &self.request_service_header, &self.request_id_header);

        let (method, timeout) = match self.validate(&parts) {
            Ok(validated) => validated,
            Err(abort) => return self.abort(ctx, abort),
        };
        ctx.record.deadline = timeout;

        let metadata = MetadataMap::from_headers(parts.headers);
        let principal = match self.authenticator.authenticate(&metadata) {
            Ok(principal) => principal,
            Err(e) => {
                debug!("Rejected stream {}: {}", stream_id, e);
                let abort = Abort::grpc(200, Code::Unauthenticated, e.to_string(), e.error_code());
                return self.abort(ctx, abort);
            }
        };

        let (tx, rx) = mpsc::channel(self.response_buffer);
        let status = StatusSlot::default();
        let guard = DeadlineGuard::new(timeout);
        let caller = CallerContext {
            user: principal.user.clone(),
            correlation_id: ctx.correlation_id.clone(),
            remote_addr: remote_addr.map(|addr| addr.ip().to_string()),
        };
        let stream = ServerStream::new(
            Arc::clone(&method.descriptor),
            metadata,
            principal,
            guard.deadline(),
            body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
            self.max_message_size,
            tx.clone(),
            Arc::clone(&status),
        );

        let handler = Arc::clone(&method.handler);
        let task = tokio::spawn(caller.scope(async move { handler.handle(stream).await }));
        tokio::spawn(drive(Arc::clone(&self.shared), ctx, task, guard, tx, status));

        let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed_unsync());
        response.headers_mut().insert(CONTENT_TYPE, self.content_type.clone());
        response
    }

    fn validate(&self, parts: &Parts) -> std::result::Result<(ServerMethod, Option<Duration>), Abort> {
        if parts.method != Method::POST {
            return Err(Abort::http(405));
        }

        let content_type = parts.headers.get(CONTENT_TYPE).ok_or_else(|| {
            Abort::grpc(415, Code::Unknown, "Missing content-type header", ErrorCode::Unspecified)
        })?;
        if !self.accepts(content_type) {
            return Err(Abort::grpc(
                415,
                Code::Unknown,
                "Unacceptable content-type header",
                ErrorCode::Unspecified,
            ));
        }

        if parts.headers.get(TE).map(HeaderValue::as_bytes) != Some(b"trailers".as_slice()) {
            return Err(Abort::grpc(
                400,
                Code::Unknown,
                "Required \"te: trailers\" header is missing",
                ErrorCode::Unspecified,
            ));
        }

        let method = self.methods.get(parts.uri.path()).cloned().ok_or_else(|| {
            Abort::grpc(200, Code::Unimplemented, "Method not found", ErrorCode::MethodNotAllowed)
        })?;

        let timeout = match parts.headers.get(GRPC_TIMEOUT_HEADER) {
            None => None,
            Some(value) => {
                let parsed = value.to_str().ok().and_then(parse_grpc_timeout);
                Some(parsed.ok_or_else(|| {
                    Abort::grpc(200, Code::Unknown, "Invalid grpc-timeout header", ErrorCode::InvalidUsage)
                })?)
            }
        };

        Ok((method, timeout))
    }

    fn accepts(&self, content_type: &HeaderValue) -> bool {
        let Ok(content_type) = content_type.to_str() else {
            return false;
        };
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        let (base, subtype) = mime.split_once('+').unwrap_or((mime, DEFAULT_SUBTYPE));
        base == GRPC_CONTENT_TYPE && subtype == self.content_subtype
    }

    fn abort(&self, ctx: CallContext, abort: Abort) -> Response<ResponseBody> {
        let mut response = Response::new(Empty::new().boxed_unsync());
        *response.status_mut() = StatusCode::from_u16(abort.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if let Some(code) = abort.code {
            let headers = self
                .shared
                .status_headers(code, abort.message.as_deref(), abort.error_code);
            response.headers_mut().insert(CONTENT_TYPE, self.content_type.clone());
            response.headers_mut().extend(headers);
        }

        ctx.finish(
            self.shared.sink.as_ref(),
            abort.http_status,
            abort.code,
            abort.message,
            None,
        );
        response
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("services", &self.services)
            .field("methods", &self.methods.len())
            .field("authenticator", &self.authenticator)
            .finish()
    }
}

enum Outcome {
    Finished(std::result::Result<std::result::Result<(), CallError>, JoinError>),
    DeadlineExceeded,
    Terminated,
}

/// Wait for the handler task and settle the stream.
async fn drive(
    shared: Arc<Shared>,
    ctx: CallContext,
    mut task: JoinHandle<std::result::Result<(), CallError>>,
    guard: DeadlineGuard,
    tx: mpsc::Sender<ResponseFrame>,
    status: StatusSlot,
) {
    let outcome = tokio::select! {
        biased;
        joined = &mut task => Outcome::Finished(joined),
        _ = guard.expired() => Outcome::DeadlineExceeded,
        _ = tx.closed() => Outcome::Terminated,
    };

    let stream_id = ctx.stream_id();
    let resolution = match outcome {
        Outcome::Finished(joined) => classify(joined, &status),
        Outcome::DeadlineExceeded => {
            let message = if cancel(task, shared.cancel_grace).await {
                info!("Deadline exceeded for stream {}", stream_id);
                DEADLINE_EXCEEDED_MESSAGE
            } else {
                error!("Failed to cancel stream {} after its deadline", stream_id);
                CANCELLATION_FAILED_MESSAGE
            };
            Resolution::Trailers {
                code: Code::DeadlineExceeded,
                message: Some(message.to_string()),
                error_code: None,
                detail: None,
            }
        }
        Outcome::Terminated => {
            if cancel(task, shared.cancel_grace).await {
                info!("Request was cancelled on stream {}", stream_id);
                Resolution::Reset { detail: None }
            } else {
                error!("Request was cancelled on stream {} but its handler did not stop", stream_id);
                Resolution::Reset {
                    detail: Some(CANCELLATION_FAILED_MESSAGE.to_string()),
                }
            }
        }
    };

    match resolution {
        Resolution::Trailers {
            code,
            message,
            error_code,
            detail,
        } => {
            let trailers = shared.status_headers(code, message.as_deref(), error_code);
            if tx.send(Ok(Frame::trailers(trailers))).await.is_err() {
                debug!("Stream {} closed before trailers were sent", stream_id);
            }
            ctx.finish(shared.sink.as_ref(), 200, Some(code), message, detail);
        }
        Resolution::Reset { detail } => {
            ctx.finish(
                shared.sink.as_ref(),
                200,
                None,
                Some(REQUEST_CANCELLED_MESSAGE.to_string()),
                detail,
            );
        }
    }
}

/// Abort the handler task; `false` when it did not stop within `grace`.
async fn cancel(mut task: JoinHandle<std::result::Result<(), CallError>>, grace: Duration) -> bool {
    task.abort();
    tokio::time::timeout(grace, &mut task).await.is_ok()
}

fn classify(
    joined: std::result::Result<std::result::Result<(), CallError>, JoinError>,
    status: &StatusSlot,
) -> Resolution {
    match joined {
        Ok(Ok(())) => {
            let (code, message) = status.lock().take().unwrap_or((Code::Ok, None));
            Resolution::Trailers {
                code,
                message,
                error_code: None,
                detail: None,
            }
        }
        Ok(Err(CallError::Rpc(err))) => Resolution::Trailers {
            code: err.code,
            message: Some(err.message),
            error_code: Some(err.error_code),
            detail: None,
        },
        Ok(Err(CallError::Protocol(err))) => {
            error!("Protocol error in handler: {}", err);
            Resolution::Trailers {
                code: Code::Internal,
                message: Some(PROTOCOL_ERROR_MESSAGE.to_string()),
                error_code: Some(ErrorCode::Unknown),
                detail: Some(err.to_string()),
            }
        }
        Ok(Err(CallError::Application(err))) => {
            error!("Application error in handler: {:?}", err);
            Resolution::Trailers {
                code: Code::Unknown,
                message: Some(APPLICATION_ERROR_MESSAGE.to_string()),
                error_code: Some(ErrorCode::Unknown),
                detail: Some(format!("{:#}", err)),
            }
        }
        Ok(Err(CallError::StreamTerminated)) => {
            info!("Request was cancelled by the peer");
            Resolution::Reset { detail: None }
        }
        Err(e) => {
            let detail = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            error!("Handler task failed: {}", detail);
            Resolution::Trailers {
                code: Code::Unknown,
                message: Some(APPLICATION_ERROR_MESSAGE.to_string()),
                error_code: Some(ErrorCode::Unknown),
                detail: Some(detail),
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolError, RpcError};

    fn slot() -> StatusSlot {
        StatusSlot::default()
    }

    #[test]
    fn test_classify_ok_uses_handler_status() {
        assert_eq!(
            classify(Ok(Ok(())), &slot()),
            Resolution::Trailers {
                code: Code::Ok,
                message: None,
                error_code: None,
                detail: None
            }
        );

        let status = slot();
        *status.lock() = Some((Code::NotFound, Some("no such user".into())));
        assert!(matches!(
            classify(Ok(Ok(())), &status),
            Resolution::Trailers { code: Code::NotFound, .. }
        ));
    }

    #[test]
    fn test_classify_typed_errors_pass_through() {
        let err = RpcError::permission_denied("not yours");
        assert_eq!(
            classify(Ok(Err(err.into())), &slot()),
            Resolution::Trailers {
                code: Code::PermissionDenied,
                message: Some("not yours".into()),
                error_code: Some(ErrorCode::PermissionDenied),
                detail: None
            }
        );
    }

    #[test]
    fn test_classify_hides_untyped_detail() {
        let resolution = classify(Ok(Err(anyhow::anyhow!("db password wrong").into())), &slot());
        match resolution {
            Resolution::Trailers {
                code,
                message,
                detail,
                ..
            } => {
                assert_eq!(code, Code::Unknown);
                assert_eq!(message.as_deref(), Some(APPLICATION_ERROR_MESSAGE));
                assert!(detail.unwrap().contains("db password wrong"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let resolution = classify(Ok(Err(ProtocolError::TruncatedFrame.into())), &slot());
        assert!(matches!(
            resolution,
            Resolution::Trailers { code: Code::Internal, .. }
        ));
    }

    #[test]
    fn test_classify_stream_termination_sends_nothing() {
        assert_eq!(
            classify(Ok(Err(CallError::StreamTerminated)), &slot()),
            Resolution::Reset { detail: None }
        );
    }

    #[tokio::test]
    async fn test_classify_panics() {
        let joined = tokio::spawn(async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), CallError>(())
        })
        .await;
        match classify(joined, &slot()) {
            Resolution::Trailers { code, detail, .. } => {
                assert_eq!(code, Code::Unknown);
                assert_eq!(detail.as_deref(), Some("panic: kaboom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_grpc_message_encoding() {
        let shared = Shared {
            sink: Arc::new(crate::server::access_log::MemoryAccessLog::new()),
            cancel_grace: Duration::from_millis(10),
            error_code_header: HeaderName::from_static("x-error-code"),
        };
        let headers = shared.status_headers(Code::Unknown, Some("100% naïve"), Some(ErrorCode::Unknown));
        assert_eq!(headers[GRPC_STATUS], "2");
        assert_eq!(headers[GRPC_MESSAGE], "100%25 na%C3%AFve");
        assert_eq!(headers["x-error-code"], "999999");
    }
}
