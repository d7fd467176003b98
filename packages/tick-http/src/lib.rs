#![deny(unreachable_pub)]
//! A cooperative, single-threaded HTTP/1.1 engine.
//!
//! Everything in this crate makes progress only when the caller drives it:
//! the server advances one step per [`HttpServer::tick`] call and the client
//! completes one exchange per request. There are no internal threads and no
//! timers; deadlines are plain [`std::time::Instant`] values checked by the
//! caller.
//!
//! Besides the usual HTTP methods the engine speaks the three UPnP eventing
//! methods `SUBSCRIBE`, `UNSUBSCRIBE` and `NOTIFY`, and supports chunked
//! transfer coding in both directions.

mod body;
mod chunked;
mod client;
mod error;
mod headers;
mod routes;
mod server;
mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use body::{BodyReader, BodySink};
pub use chunked::{ChunkedState, ChunkedWriter};
pub use client::{ClientConfig, HttpClient, Request, RequestBody};
pub use error::{HttpError, HttpResult};
pub use headers::{Headers, Method, ReplyHead, RequestHead, reason_phrase};
pub use routes::{Handler, RouteTarget, Router};
pub use server::{Exchange, HttpServer, ServerConfig};
pub use transport::{ByteStream, Connect, Listen, TcpByteStream, TcpConnector, TcpListenerSource};

/// The default TCP port assumed when a URL does not carry one.
pub const HTTP_PORT: u16 = 80;
