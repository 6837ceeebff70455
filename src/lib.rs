//! # Spindle
//! An event-driven TCP transport for Rust built on [`mio`], modeled on the
//! boss/worker reactor pattern: a small group of event loops accepts
//! connections, a larger group owns them, and per-connection handler
//! pipelines process traffic without an async runtime.
//!
//! ## Core Philosophy
//! Spindle is for servers that want:
//! - **Thread affinity**: every connection is owned by exactly one event
//!   loop thread for its whole life, so handler state needs no locking
//! - **Explicit propagation**: handlers decide what flows through the
//!   pipeline; nothing is forwarded behind your back
//! - **Runtime-agnostic architecture** that doesn't force async/await
//! - **Backpressure** as a first-class switch, not an afterthought
//!
//! ## Architecture Overview
//! ```text
//! ┌────────────┐ accept  ┌─────────────────────────────────────┐
//! │ boss group │────────▶│ worker group (one thread per loop)  │
//! │ (Acceptor) │         │  ┌─────────┐  ┌──────────────────┐  │
//! └────────────┘         │  │ Channel │──│ Pipeline         │  │
//!                        │  └─────────┘  │ [head .. tail]   │  │
//!                        │               └──────────────────┘  │
//!                        └─────────────────────────────────────┘
//!                                 ▲ tasks (any thread)
//!                        ChannelHandle / ChannelGroup
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spindle::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> spindle::Result<()> {
//!         // Bytes in, same bytes out.
//!         ctx.write_and_flush(msg)
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let boss = EventLoopGroup::new("boss", 1)?;
//!     let workers = EventLoopGroup::new("worker", 0)?; // one loop per core
//!
//!     let config = ServerConfig::builder()
//!         .address("127.0.0.1:8080".parse()?)
//!         .build();
//!
//!     let server = ServerBootstrap::bind(config, &boss, &workers, |pipeline| {
//!         pipeline.add_last("echo", Echo);
//!     })?
//!     .wait()?;
//!
//!     println!("listening on {}", server.local_addr());
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```
//!
//! - [`EventLoopGroup`] / [`EventLoop`]: the reactor threads
//! - [`Handler`] / [`Pipeline`]: per-connection processing chains
//! - [`ChannelHandle`]: cross-thread operations on one connection
//! - [`ChannelGroup`]: broadcast to many connections at once
//! - [`ServerBootstrap`] / [`ServerConfig`]: binding and wiring
//! - [`error`]: error types and result handling

mod acceptor;
pub mod channel;
pub mod channel_group;
pub mod codec;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod pipeline;
pub mod server;

pub use channel::{ChannelHandle, ChannelId, ChannelState};
pub use channel_group::ChannelGroup;
pub use codec::{StringDecoder, StringEncoder};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, EventLoopGroup, LoopHandle, Task};
pub use handler::Handler;
pub use pipeline::{Context, Message, Pipeline};
pub use server::{BindFuture, Initializer, ServerBootstrap, ServerConfig, ServerHandle};

/// Re-exports of the types nearly every user of the crate touches.
///
/// ```rust
/// use spindle::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{ChannelHandle, ChannelId};
    pub use crate::channel_group::ChannelGroup;
    pub use crate::codec::{StringDecoder, StringEncoder};
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::EventLoopGroup;
    pub use crate::handler::Handler;
    pub use crate::pipeline::{Context, Message, Pipeline};
    pub use crate::server::{ServerBootstrap, ServerConfig};
}
