//! The server side of one in-flight call, as seen by an application handler.

use super::framing::{encode_frame, FrameDecoder};
use crate::auth::Principal;
use crate::error::{BoxError, CallError, ProtocolError, RpcError};
use crate::registry::MethodDescriptor;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::Code;

pub(crate) type RequestBody = UnsyncBoxBody<Bytes, BoxError>;
pub(crate) type ResponseFrame = Result<Frame<Bytes>, Infallible>;

/// Status a handler chose for an otherwise successful call.
pub(crate) type StatusSlot = Arc<Mutex<Option<(Code, Option<String>)>>>;

/// Request messages in, reply messages out.
pub struct ServerStream {
    method: Arc<MethodDescriptor>,
    metadata: MetadataMap,
    principal: Principal,
    deadline: Option<Instant>,
    body: RequestBody,
    body_done: bool,
    decoder: FrameDecoder,
    replies: mpsc::Sender<ResponseFrame>,
    status: StatusSlot,
}

impl ServerStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Arc<MethodDescriptor>,
        metadata: MetadataMap,
        principal: Principal,
        deadline: Option<Instant>,
        body: RequestBody,
        max_message_size: usize,
        replies: mpsc::Sender<ResponseFrame>,
        status: StatusSlot,
    ) -> Self {
        Self {
            method,
            metadata,
            principal,
            deadline,
            body,
            body_done: false,
            decoder: FrameDecoder::new(max_message_size),
            replies,
            status,
        }
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Next raw request message; `None` once the caller half-closed.
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, CallError> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }
            if self.body_done {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::TruncatedFrame.into());
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.decoder.push(&data);
                    }
                }
                Some(Err(e)) => return Err(ProtocolError::Body(e.to_string()).into()),
                None => self.body_done = true,
            }
        }
    }

    pub async fn recv<T: prost::Message + Default>(&mut self) -> Result<Option<T>, CallError> {
        match self.recv_message().await? {
            Some(message) => Ok(Some(T::decode(message).map_err(ProtocolError::from)?)),
            None => Ok(None),
        }
    }

    /// The request of a unary-request method.
    pub async fn recv_single<T: prost::Message + Default>(&mut self) -> Result<T, CallError> {
        self.recv()
            .await?
            .ok_or_else(|| RpcError::invalid_argument("Expected a request message").into())
    }

    pub async fn send_message(&mut self, message: Bytes) -> Result<(), CallError> {
        self.replies
            .send(Ok(Frame::data(encode_frame(&message))))
            .await
            .map_err(|_| CallError::StreamTerminated)
    }

    pub async fn send<T: prost::Message>(&mut self, message: &T) -> Result<(), CallError> {
        self.send_message(Bytes::from(message.encode_to_vec())).await
    }

    /// Finish with `code` instead of OK once the handler returns.
    pub fn set_status(&self, code: Code, message: Option<String>) {
        *self.status.lock() = Some((code, message));
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("method", &self.method.path)
            .field("deadline", &self.deadline)
            .finish()
    }
}
