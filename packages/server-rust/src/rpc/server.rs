//! RPC responder: consumes requests, dispatches them and publishes replies.
//!
//! Follows the deferred startup pattern: `new()` wires the pipeline and
//! allocates the shutdown controller so the HTTP façade can share it, and
//! `serve()` declares the queue and runs until the shutdown future fires.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use parley_core::{RemoteErrorKind, RequestEnvelope, ResponseEnvelope};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{error, info, warn};

use super::middleware::{build_dispatch_pipeline, DispatchPipeline};
use super::retry::RetryPolicy;
use super::router::{Dispatch, Router};
use super::transport::{
    ConsumeOptions, Delivery, DeliveryStream, QueueOptions, Transport, TransportError,
};
use crate::shutdown::ShutdownController;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for an [`RpcServer`].
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Well-known request queue.
    pub queue: String,
    /// Maximum handlers running at once; also the broker prefetch.
    pub pool_size: usize,
    /// Deadline for a single handler invocation.
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight handlers before aborting them.
    pub grace_period: Duration,
    pub publish_retry: RetryPolicy,
    pub resubscribe_retry: RetryPolicy,
    pub consumer_tag: String,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            queue: "rpc_server".to_string(),
            pool_size: 10,
            handler_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            publish_retry: RetryPolicy::default(),
            resubscribe_retry: RetryPolicy::default(),
            consumer_tag: "parley-responder".to_string(),
        }
    }
}

/// Fatal responder failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to declare request queue `{queue}`: {source}")]
    Declare {
        queue: String,
        source: TransportError,
    },
    #[error("lost subscription to `{queue}` after exhausting retries: {source}")]
    ConsumeExhausted {
        queue: String,
        source: TransportError,
    },
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

/// Consumes the request queue with a bounded pool of concurrent handlers.
pub struct RpcServer {
    transport: Arc<dyn Transport>,
    responder: Responder,
    config: RpcServerConfig,
    shutdown: Arc<ShutdownController>,
}

impl RpcServer {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, router: Arc<Router>, config: RpcServerConfig) -> Self {
        let responder = Responder {
            transport: Arc::clone(&transport),
            pipeline: build_dispatch_pipeline(router, config.handler_timeout),
            publish_retry: config.publish_retry,
        };
        Self {
            transport,
            responder,
            config,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared controller exposing health and in-flight state.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Consumes requests until `shutdown` resolves, then drains.
    ///
    /// A permit from the worker pool is taken before each delivery is
    /// pulled, so at most `pool_size` requests are ever held unsettled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` when the request queue cannot be declared or
    /// the subscription cannot be restored. In-flight handlers are still
    /// drained before returning.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), ServerError> {
        let queue = self.config.queue.clone();
        self.transport
            .declare(&queue, QueueOptions::request_queue())
            .await
            .map_err(|source| ServerError::Declare {
                queue: queue.clone(),
                source,
            })?;

        let pool_size = self.config.pool_size.max(1);
        let options = ConsumeOptions::new(
            self.config.consumer_tag.clone(),
            u16::try_from(pool_size).unwrap_or(u16::MAX),
        );
        let mut stream = self.subscribe(&options).await?;

        let permits = Arc::new(Semaphore::new(pool_size));
        let mut tasks = JoinSet::new();

        self.shutdown.set_ready();
        info!(queue = %queue, pool_size, "RPC server consuming requests");

        tokio::pin!(shutdown);
        let outcome = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                () = &mut shutdown => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break Ok(()),
                },
            };

            let next = tokio::select! {
                () = &mut shutdown => break Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let guard = self.shutdown.in_flight_guard();
                    let responder = self.responder.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _guard = guard;
                        responder.handle(delivery).await;
                    });
                    continue;
                }
                Some(Err(e)) => {
                    warn!(queue = %queue, error = %e, "request stream failed, resubscribing");
                }
                None => {
                    warn!(queue = %queue, "request stream ended, resubscribing");
                }
            }

            let fresh = tokio::select! {
                () = &mut shutdown => break Ok(()),
                fresh = self.subscribe(&options) => fresh,
            };
            match fresh {
                Ok(fresh) => stream = fresh,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &outcome {
            error!(queue = %queue, error = %e, "RPC server halting");
        }
        self.drain(tasks).await;
        outcome
    }

    /// Declares the request queue again before each attempt, since a broker
    /// may have lost it together with the connection.
    async fn subscribe(&self, options: &ConsumeOptions) -> Result<DeliveryStream, ServerError> {
        let queue = self.config.queue.as_str();
        self.config
            .resubscribe_retry
            .run("subscribe_requests", || async {
                self.transport
                    .declare(queue, QueueOptions::request_queue())
                    .await?;
                self.transport.consume(queue, options.clone()).await
            })
            .await
            .map_err(|source| ServerError::ConsumeExhausted {
                queue: queue.to_string(),
                source,
            })
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        self.shutdown.trigger_shutdown();
        let in_flight = self.shutdown.in_flight_count();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight handlers");
        }

        if !self.shutdown.wait_for_drain(self.config.grace_period).await {
            warn!(
                remaining = tasks.len(),
                grace_ms = u64::try_from(self.config.grace_period.as_millis()).unwrap_or(u64::MAX),
                "grace period elapsed, aborting handlers"
            );
            tasks.abort_all();
        }
        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }
        self.shutdown.mark_stopped();
        info!("RPC server stopped");
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "request task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Per-delivery work: decode, dispatch, reply, settle.
#[derive(Clone)]
struct Responder {
    transport: Arc<dyn Transport>,
    pipeline: DispatchPipeline,
    publish_retry: RetryPolicy,
}

impl Responder {
    async fn handle(&self, delivery: Delivery) {
        let request = match RequestEnvelope::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    error = %e,
                    bytes = delivery.body.len(),
                    redelivered = delivery.redelivered,
                    "MalformedRequest: dropping request"
                );
                settle(delivery).await;
                return;
            }
        };

        let RequestEnvelope {
            routing_key,
            correlation_id,
            reply_to,
            payload,
        } = request;

        let dispatch = Dispatch {
            routing_key,
            correlation_id: correlation_id.clone(),
            payload,
        };
        let result = AssertUnwindSafe(self.pipeline.clone().oneshot(dispatch))
            .catch_unwind()
            .await;

        let response = match result {
            Ok(Ok(body)) => ResponseEnvelope::success(correlation_id, body),
            Ok(Err(e)) => ResponseEnvelope::failure(correlation_id, e.kind(), e.message()),
            Err(_panic) => {
                error!(correlation_id = %correlation_id, "handler panicked");
                ResponseEnvelope::failure(
                    correlation_id,
                    RemoteErrorKind::Internal,
                    "handler panicked",
                )
            }
        };

        self.reply(&reply_to, &response).await;
        settle(delivery).await;
    }

    /// Publishes `response`; failures are logged once the retry budget is
    /// spent so the request can still be settled.
    async fn reply(&self, reply_to: &str, response: &ResponseEnvelope) {
        let frame = match response.encode() {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                error!(correlation_id = %response.correlation_id, error = %e, "failed to encode reply");
                return;
            }
        };

        let published = self
            .publish_retry
            .run("publish_reply", || self.transport.publish(reply_to, frame.clone()))
            .await;
        if let Err(e) = published {
            error!(
                correlation_id = %response.correlation_id,
                reply_to,
                error = %e,
                "reply lost"
            );
        }
    }
}

async fn settle(delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "failed to ack request");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
