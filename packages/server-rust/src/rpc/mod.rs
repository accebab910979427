//! RPC over a message broker.
//!
//! - [`transport`]: Broker surface (declare, publish, consume, settle)
//! - [`amqp`]: `lapin` binding for RabbitMQ
//! - [`memory`]: In-process broker for tests and `memory://` URLs
//! - [`registry`]: Correlation id to waiting caller
//! - [`client`]: Request/response calls with timeout
//! - [`server`]: Bounded-concurrency responder
//! - [`router`]: Routing key to handler table
//! - [`middleware`]: Tower layers wrapping dispatch

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod client;
pub mod memory;
pub mod middleware;
pub mod registry;
pub mod retry;
pub mod router;
pub mod server;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpTransport, ConnectOptions};
pub use client::{CallError, RpcClient, RpcClientConfig};
pub use memory::{MemoryBroker, QueueStats};
pub use registry::{CancelReason, CompletionHandle, CorrelationRegistry, RegistryError, Resolution};
pub use retry::RetryPolicy;
pub use router::{handler_fn, Dispatch, DispatchError, Handler, HandlerError, Router, RouterError};
pub use server::{RpcServer, RpcServerConfig, ServerError};
pub use transport::{
    Acknowledger, ConsumeOptions, Delivery, DeliveryStream, QueueOptions, Transport,
    TransportError,
};
