//! Listening-side channel: accepts connections on a boss loop and hands
//! each one to a worker loop.

use std::io;
use std::net::SocketAddr;

use mio::net::TcpListener;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::event_loop::LoopHandle;
use crate::server::Initializer;

pub(crate) struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    init: Arc<Initializer>,
    workers: Vec<LoopHandle>,
    next_worker: usize,
    max_accepts: usize,
    nodelay: bool,
}

impl Acceptor {
    pub(crate) fn new(
        listener: TcpListener,
        local_addr: SocketAddr,
        init: Arc<Initializer>,
        workers: Vec<LoopHandle>,
        max_accepts: usize,
        nodelay: bool,
    ) -> Self {
        Self {
            listener,
            local_addr,
            init,
            workers,
            next_worker: 0,
            max_accepts: max_accepts.max(1),
            nodelay,
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// One readiness-driven accept pass: accepts up to the per-cycle cap so
    /// a connect flood cannot starve the boss loop's other work. Transient
    /// accept errors end the pass; the listener stays registered and the
    /// next readiness event resumes accepting.
    pub(crate) fn accept_cycle(&mut self) {
        for _ in 0..self.max_accepts {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!(peer = %peer, error = %e, "set_nodelay failed");
                        }
                    }
                    self.hand_off(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Assigns the connection to a worker loop round-robin and submits the
    /// install task. The worker thread does the rest: registration,
    /// pipeline construction, lifecycle events.
    fn hand_off(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        let worker = self.workers[self.next_worker % self.workers.len()].clone();
        self.next_worker = self.next_worker.wrapping_add(1);
        let init = Arc::clone(&self.init);
        trace!(peer = %peer, "accepted connection");
        if worker
            .submit(move |el| el.install_channel(stream, peer, init))
            .is_err()
        {
            warn!(peer = %peer, "worker loop is gone, dropping connection");
        }
    }
}
