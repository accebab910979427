//! RPC client: request/response calls over a publish/subscribe broker.
//!
//! Each client owns one exclusive reply queue and one background task that
//! consumes it. Callers register a waiter in the [`CorrelationRegistry`],
//! publish their request and wait for the reply loop to resolve them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use parley_core::translation::{from_payload, to_payload};
use parley_core::{
    CodecError, CorrelationId, RemoteErrorKind, RequestEnvelope, ResponseEnvelope, ResponseStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{CancelReason, CompletionHandle, CorrelationRegistry, RegistryError, Resolution};
use super::retry::RetryPolicy;
use super::transport::{
    ConsumeOptions, Delivery, DeliveryStream, QueueOptions, Transport, TransportError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for an [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Queue the responders consume from.
    pub server_queue: String,
    /// Prefix of this client's reply queue; a per-instance tag is appended.
    pub reply_queue_prefix: String,
    /// Timeout used by [`RpcClient::request`].
    pub default_timeout: Duration,
    /// Unacknowledged replies the broker may push ahead.
    pub reply_prefetch: u16,
    pub publish_retry: RetryPolicy,
    pub resubscribe_retry: RetryPolicy,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            server_queue: "rpc_server".to_string(),
            reply_queue_prefix: "rpc_client".to_string(),
            default_timeout: Duration::from_secs(2),
            reply_prefetch: 64,
            publish_retry: RetryPolicy::default(),
            resubscribe_retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a call produced no payload.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationId(CorrelationId),
    #[error("correlation id must not be empty")]
    EmptyCorrelationId,
    #[error("rpc timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("rpc client is closed")]
    ClientClosed,
    /// The responder answered with an error indicator.
    #[error("remote {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateCorrelationId(id) => Self::DuplicateCorrelationId(id),
            RegistryError::EmptyCorrelationId => Self::EmptyCorrelationId,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Issues calls to remote handlers and waits for their correlated replies.
///
/// Safe to share between tasks behind an `Arc`; any number of calls may be in
/// flight at once.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    registry: CorrelationRegistry,
    config: RpcClientConfig,
    reply_to: String,
    closed: CancellationToken,
    reply_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Declares this client's reply queue and starts consuming it.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Transport` if the queue cannot be declared or the
    /// first subscription fails.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: RpcClientConfig,
    ) -> Result<Self, CallError> {
        let reply_to = format!("{}.{}", config.reply_queue_prefix, Uuid::new_v4().simple());
        transport
            .declare(&reply_to, QueueOptions::reply_queue())
            .await?;

        let options = ConsumeOptions::new(format!("{reply_to}.consumer"), config.reply_prefetch);
        let stream = transport.consume(&reply_to, options.clone()).await?;

        let registry = CorrelationRegistry::new();
        let closed = CancellationToken::new();
        let reply_loop = ReplyLoop {
            transport: Arc::clone(&transport),
            registry: registry.clone(),
            queue: reply_to.clone(),
            options,
            resubscribe_retry: config.resubscribe_retry,
            closed: closed.clone(),
        };
        let task = tokio::spawn(reply_loop.run(stream));

        info!(reply_to = %reply_to, server_queue = %config.server_queue, "RPC client connected");

        Ok(Self {
            transport,
            registry,
            config,
            reply_to,
            closed,
            reply_loop: Mutex::new(Some(task)),
        })
    }

    /// The queue this client receives replies on.
    #[must_use]
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Replies that arrived after their caller had given up.
    #[must_use]
    pub fn late_deliveries(&self) -> u64 {
        self.registry.late_deliveries()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Calls the handler behind `routing_key` and waits up to `timeout`.
    ///
    /// # Errors
    ///
    /// - `CallError::Timeout` when no reply arrives in time
    /// - `CallError::ClientClosed` when the client closes first
    /// - `CallError::Remote` when the responder reports a failure
    /// - `CallError::Transport` when publishing exhausts its retry budget
    pub async fn call(
        &self,
        routing_key: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        let id = CorrelationId::new(Uuid::new_v4().to_string());
        self.call_with_id(id, routing_key, payload, timeout).await
    }

    /// Like [`Self::call`] but with a caller-chosen correlation id.
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`], plus `CallError::DuplicateCorrelationId` when
    /// `id` is already pending on this client and `CallError::EmptyCorrelationId`
    /// when `id` is empty. A reply to an earlier call that used the same `id`
    /// never completes this one.
    pub async fn call_with_id(
        &self,
        id: CorrelationId,
        routing_key: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        if self.closed.is_cancelled() {
            return Err(CallError::ClientClosed);
        }

        // Register before publishing so a fast reply always finds its waiter.
        let handle = self.registry.register(id.clone())?;
        let frame = RequestEnvelope::new(
            routing_key,
            handle.wire_id().clone(),
            self.reply_to.clone(),
            payload,
        )
        .encode()?;
        let timeout_ms = millis(timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        // Whichever branch loses is dropped, and the handle with it, which
        // removes the pending call.
        tokio::select! {
            () = self.closed.cancelled() => Err(CallError::ClientClosed),
            () = tokio::time::sleep_until(deadline) => {
                warn!(correlation_id = %id, routing_key, timeout_ms, "rpc call timed out");
                Err(CallError::Timeout { timeout_ms })
            }
            result = self.publish_and_wait(handle, Bytes::from(frame), timeout_ms) => result,
        }
    }

    async fn publish_and_wait(
        &self,
        handle: CompletionHandle,
        frame: Bytes,
        timeout_ms: u64,
    ) -> Result<Bytes, CallError> {
        let destination = self.config.server_queue.as_str();
        self.config
            .publish_retry
            .run("publish_request", || {
                self.transport.publish(destination, frame.clone())
            })
            .await?;

        match handle.wait().await {
            Resolution::Response(response) => match response.status {
                ResponseStatus::Success => Ok(response.payload),
                ResponseStatus::Failure { kind, message } => {
                    Err(CallError::Remote { kind, message })
                }
            },
            Resolution::Cancelled(CancelReason::Timeout) => Err(CallError::Timeout { timeout_ms }),
            Resolution::Cancelled(CancelReason::ClientClosed) => Err(CallError::ClientClosed),
        }
    }

    /// Typed call: `req` and the reply are JSON bodies. Uses the configured
    /// default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`], plus `CallError::Codec` when either body
    /// fails to (de)serialize.
    pub async fn request<Req, Resp>(&self, routing_key: &str, req: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = to_payload(req)?;
        let body = self
            .call(routing_key, payload, self.config.default_timeout)
            .await?;
        Ok(from_payload(&body)?)
    }

    /// Fails every pending call with `ClientClosed` and stops the reply
    /// consumer. Later calls fail immediately. The transport stays open;
    /// its owner closes it.
    pub async fn close(&self) {
        self.closed.cancel();
        let cancelled = self.registry.cancel_all(CancelReason::ClientClosed);

        let task = self.reply_loop.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "reply consumer ended abnormally");
            }
        }
        info!(reply_to = %self.reply_to, cancelled, "RPC client closed");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_to", &self.reply_to)
            .field("server_queue", &self.config.server_queue)
            .field("pending", &self.registry.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reply loop
// ---------------------------------------------------------------------------

/// Background consumer feeding replies into the registry.
struct ReplyLoop {
    transport: Arc<dyn Transport>,
    registry: CorrelationRegistry,
    queue: String,
    options: ConsumeOptions,
    resubscribe_retry: RetryPolicy,
    closed: CancellationToken,
}

impl ReplyLoop {
    async fn run(self, mut stream: DeliveryStream) {
        loop {
            let next = tokio::select! {
                () = self.closed.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.on_delivery(delivery).await,
                Some(Err(e)) => {
                    warn!(queue = %self.queue, error = %e, "reply stream failed, resubscribing");
                    match self.resubscribe().await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
                None => {
                    warn!(queue = %self.queue, "reply stream ended, resubscribing");
                    match self.resubscribe().await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
            }
        }
        debug!(queue = %self.queue, "reply consumer stopped");
    }

    async fn on_delivery(&self, delivery: Delivery) {
        match ResponseEnvelope::decode(&delivery.body) {
            Ok(response) => {
                self.registry.resolve(response);
            }
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "dropping undecodable reply");
            }
        }
        if let Err(e) = delivery.ack().await {
            warn!(queue = %self.queue, error = %e, "failed to ack reply");
        }
    }

    /// Returns a fresh stream, or `None` once the client is closing or the
    /// retry budget is spent. In the latter case the client is closed too,
    /// since no reply could ever reach its callers.
    ///
    /// The reply queue is auto-delete, so the broker drops it together with
    /// the lost consumer; every attempt declares it again first.
    async fn resubscribe(&self) -> Option<DeliveryStream> {
        let attempt = self.resubscribe_retry.run("resubscribe_replies", || async {
            self.transport
                .declare(&self.queue, QueueOptions::reply_queue())
                .await?;
            self.transport.consume(&self.queue, self.options.clone()).await
        });

        let result = tokio::select! {
            () = self.closed.cancelled() => return None,
            result = attempt => result,
        };

        match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(queue = %self.queue, error = %e, "reply consumer lost, closing client");
                self.closed.cancel();
                self.registry.cancel_all(CancelReason::ClientClosed);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
