//! Bidirectional RPC protocol over a self-describing binary value codec.
//!
//! Peers exchange [Packet]s that are objects encoded with the tagged
//! [Value] codec. A client invokes procedures (fire and forget), functions
//! (one result) and observables (a stream of results). Observable elements
//! are delivered one at a time: the server waits for the client to ack each
//! element before producing the next.
//!
//! Invocations name an operation on a [Service] that is reached from the
//! root service through a chain of getters.
//!
//! ```no_run
//! # async fn example() -> Result<(), rawrpc::CallError> {
//! use futures::StreamExt as _;
//! use rawrpc::{Config, Endpoint, Invocation, Service, Value};
//! use std::time::Duration;
//!
//! let config = Config {
//!     observable_ack_timeout: Duration::from_secs(5),
//!     heartbeat_interval: Duration::from_secs(1),
//!     call_timeout: Duration::from_secs(10),
//!     stream_idle_timeout: None,
//! };
//! let (a_send, b_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
//! let (b_send, a_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
//! let ok = Ok::<_, std::convert::Infallible>;
//!
//! let mut service = Service::new();
//! service.add_function("add", |(a, b): (i32, i32)| async move { Ok(a + b) });
//! let _server = Endpoint::new(b_send, b_receive.map(ok), service, &config);
//!
//! let mut client = Endpoint::new_client(a_send, a_receive.map(ok), &config);
//! let sum = client
//!     .client()
//!     .call(Invocation::new("add").args(vec![Value::Int(1), Value::Int(2)]))
//!     .await?;
//! assert_eq!(sum, Value::Int(3));
//! # Ok(())
//! # }
//! ```
mod client;
mod config;
pub mod decode;
pub mod encode;
mod endpoint;
mod error;
mod message;
mod packet_stream;
pub mod server;
mod service;
pub mod session;
mod value;

#[cfg(test)]
mod test_utils;

pub use client::{CallError, Client, RemoteTimeoutError, Subscription};
pub use config::{ClientConfig, Config, ConfigError, SessionConfig};
pub use endpoint::Endpoint;
pub use error::RemoteError;
pub use message::{
    Ack, GetterLink, Invocation, InvocationMessage, Packet, PacketParseError, Request, Response,
    ENCODE_ERROR,
};
pub use packet_stream::{NextPacketError, PacketStream};
pub use service::{
    ArgsError, BoxCall, BoxObservable, BoxProcedure, DispatchError, FromArgs, Service,
};
pub use value::{ArgLists, FromValue, IntoValue, Marker, TypeMismatch, Value};
