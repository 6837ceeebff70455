use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;

use thiserror::Error;

pub type Result<T, E = Error> = StdResult<T, E>;

/// Errors surfaced by the transport core.
///
/// Transient conditions (`WouldBlock` on accept, read or write) are handled
/// inside the event loop and retried on the next readiness cycle; they never
/// appear here. Everything below is either connection-fatal (routed to
/// `exception_caught` on the owning channel's pipeline), loop-fatal
/// (returned from [`EventLoop::run`](crate::EventLoop::run)), or a
/// configuration error surfaced synchronously at bind time.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bind to {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("outbound message reached the transport without being encoded to bytes")]
    UnsupportedMessage,

    #[error("event loop is shut down")]
    LoopShutdown,

    #[error("handler error: {0}")]
    Handler(String),
}
