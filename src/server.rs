//! Server configuration and bootstrap.

use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use mio::net::TcpListener;
use tracing::debug;

use crate::acceptor::Acceptor;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoopGroup, LoopHandle};
use crate::pipeline::Pipeline;

/// Per-connection pipeline construction, run exactly once on the owning
/// loop's thread when a channel is installed.
pub type Initializer = dyn Fn(&mut Pipeline) + Send + Sync + 'static;

/// Configuration for a TCP server.
///
/// Use `ServerConfig::builder()` for construction. `backlog` and
/// `keep_alive` are carried configuration: they are part of the server's
/// contract but the current transport applies OS defaults for both.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub address: SocketAddr,
    /// Requested accept backlog.
    pub backlog: u32,
    /// SO_KEEPALIVE setting for accepted connections.
    pub keep_alive: Option<Duration>,
    /// Enable TCP_NODELAY on accepted connections.
    pub no_delay: bool,
    /// Upper bound on accepts per readiness cycle, so a connect flood
    /// cannot monopolize the boss loop.
    pub max_accepts_per_cycle: usize,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            backlog: 128,
            keep_alive: Some(Duration::from_secs(60)),
            no_delay: true,
            max_accepts_per_cycle: 64,
        }
    }
}

/// Builder for [`ServerConfig`]; unset fields fall back to
/// `ServerConfig::default()`.
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    backlog: Option<u32>,
    keep_alive: Option<Option<Duration>>,
    no_delay: Option<bool>,
    max_accepts_per_cycle: Option<usize>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            address: None,
            backlog: None,
            keep_alive: None,
            no_delay: None,
            max_accepts_per_cycle: None,
        }
    }

    /// Set the address to bind to.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the requested accept backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Set SO_KEEPALIVE for accepted connections.
    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Cap the number of connections accepted per readiness cycle.
    pub fn max_accepts_per_cycle(mut self, max: usize) -> Self {
        self.max_accepts_per_cycle = Some(max);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            backlog: self.backlog.unwrap_or(default.backlog),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            max_accepts_per_cycle: self
                .max_accepts_per_cycle
                .unwrap_or(default.max_accepts_per_cycle),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds listening sockets and wires them to event loop groups.
pub struct ServerBootstrap;

impl ServerBootstrap {
    /// Binds the listening socket synchronously (configuration errors, such
    /// as an address already in use, surface here), then registers the
    /// acceptor on one of the boss loops. The returned [`BindFuture`]
    /// completes once the acceptor is live and accepting.
    ///
    /// `init` runs once per accepted connection, on that connection's
    /// worker loop thread.
    pub fn bind<F>(
        config: ServerConfig,
        boss: &EventLoopGroup,
        workers: &EventLoopGroup,
        init: F,
    ) -> Result<BindFuture>
    where
        F: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(config.address).map_err(|source| Error::Bind {
            addr: config.address,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "socket bound");

        let acceptor = Acceptor::new(
            listener,
            local_addr,
            Arc::new(init) as Arc<Initializer>,
            workers.handles().to_vec(),
            config.max_accepts_per_cycle,
            config.no_delay,
        );

        let (tx, rx) = mpsc::channel();
        let boss_handle = boss.next().clone();
        boss_handle.submit(move |el| el.register_acceptor(acceptor, tx))?;

        Ok(BindFuture {
            completion: rx,
            local_addr,
            boss: boss_handle,
        })
    }
}

/// Pending acceptor registration. `wait` blocks until the boss loop has the
/// listener in its selector and reports success or failure explicitly.
pub struct BindFuture {
    completion: mpsc::Receiver<Result<()>>,
    local_addr: SocketAddr,
    boss: LoopHandle,
}

impl BindFuture {
    pub fn wait(self) -> Result<ServerHandle> {
        self.completion.recv().map_err(|_| Error::LoopShutdown)??;
        Ok(ServerHandle {
            local_addr: self.local_addr,
            boss: self.boss,
        })
    }
}

/// A live server: the bound address (including the OS-chosen port when
/// binding to port 0) and the means to stop accepting.
pub struct ServerHandle {
    local_addr: SocketAddr,
    boss: LoopHandle,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Channels that are already installed
    /// keep running until they close or their group shuts down.
    pub fn close(&self) -> Result<()> {
        self.boss.submit(|el| el.close_acceptors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_unset_fields_from_defaults() {
        let config = ServerConfig::builder()
            .address(SocketAddr::from(([0, 0, 0, 0], 9000)))
            .no_delay(false)
            .build();
        assert_eq!(config.address.port(), 9000);
        assert!(!config.no_delay);
        assert_eq!(config.backlog, ServerConfig::default().backlog);
        assert_eq!(
            config.max_accepts_per_cycle,
            ServerConfig::default().max_accepts_per_cycle
        );
    }

    #[test]
    fn bind_reports_the_ephemeral_port() {
        let boss = EventLoopGroup::new("boss", 1).expect("boss group");
        let workers = EventLoopGroup::new("worker", 1).expect("worker group");
        let config = ServerConfig::builder()
            .address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build();

        let server = ServerBootstrap::bind(config, &boss, &workers, |_pipeline| {})
            .expect("bind")
            .wait()
            .expect("acceptor registration");
        assert_ne!(server.local_addr().port(), 0);
        server.close().expect("close");
    }

    #[test]
    fn bind_to_an_occupied_address_fails_synchronously() {
        let boss = EventLoopGroup::new("boss2", 1).expect("boss group");
        let workers = EventLoopGroup::new("worker2", 1).expect("worker group");

        let first = ServerBootstrap::bind(
            ServerConfig::builder()
                .address(SocketAddr::from(([127, 0, 0, 1], 0)))
                .build(),
            &boss,
            &workers,
            |_pipeline| {},
        )
        .expect("bind")
        .wait()
        .expect("acceptor registration");

        let res = ServerBootstrap::bind(
            ServerConfig::builder().address(first.local_addr()).build(),
            &boss,
            &workers,
            |_pipeline| {},
        );
        assert!(matches!(res, Err(Error::Bind { .. })));
    }
}
