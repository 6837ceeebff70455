//! Single-threaded event loops and the fixed-size groups that own them.
//!
//! Each [`EventLoop`] runs a poll → dispatch → drain-tasks cycle on one
//! dedicated thread for its whole life. Every channel is owned by exactly
//! one loop; all of its pipeline dispatch happens on that thread. Other
//! threads interact with a loop only through its [`LoopHandle`], which
//! pushes a task onto the loop's queue and wakes the poll.
//!
//! Within one cycle, readiness-driven I/O dispatch runs first and queued
//! tasks second; callers that need ordering relative to I/O must go through
//! tasks and never assume interleaving finer than per-cycle.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::acceptor::Acceptor;
use crate::channel::{Channel, ChannelId, ChannelState};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::pipeline::{self, Message};
use crate::server::Initializer;

pub(crate) const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const POLL_TIMEOUT_MS: u64 = 100;
const READ_BUFFER_SIZE: usize = 8192;

/// Work submitted to a loop from any thread; runs on the loop's thread with
/// exclusive access to the loop and everything it owns.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;

/// Cross-thread submission side of one event loop.
#[derive(Clone)]
pub struct LoopHandle {
    sender: mpsc::Sender<Task>,
    waker: Arc<Waker>,
}

impl LoopHandle {
    /// Submits a task to run on the loop's thread, in submission order
    /// relative to this handle's other tasks, interleaved per-cycle with
    /// readiness dispatch.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .map_err(|_| Error::LoopShutdown)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Requests a graceful stop: remaining tasks run, then every owned
    /// channel goes through its full close lifecycle and the loop thread
    /// exits.
    pub fn shutdown(&self) {
        let _ = self.submit(|el| el.request_stop());
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    channels: HashMap<Token, Channel>,
    acceptors: HashMap<Token, Acceptor>,
    tasks: mpsc::Receiver<Task>,
    handle: LoopHandle,
    ids: Arc<AtomicU64>,
    next_token: usize,
    read_buf: Vec<u8>,
    stopping: bool,
}

impl EventLoop {
    /// A standalone loop with its own channel-id space. Loops that share a
    /// group are built through [`EventLoopGroup`] instead, so ids stay
    /// unique across the group.
    pub fn new() -> Result<Self> {
        Self::with_ids(Arc::new(AtomicU64::new(1)))
    }

    pub(crate) fn with_ids(ids: Arc<AtomicU64>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (sender, tasks) = mpsc::channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            channels: HashMap::new(),
            acceptors: HashMap::new(),
            tasks,
            handle: LoopHandle {
                sender,
                waker: Arc::new(waker),
            },
            ids,
            next_token: WAKER_TOKEN.0 + 1,
            read_buf: vec![0; READ_BUFFER_SIZE],
            stopping: false,
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Number of channels currently owned by this loop.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn request_stop(&mut self) {
        self.stopping = true;
    }

    /// Runs the loop until a graceful stop or a selector failure. A poll
    /// failure is loop-fatal: every owned channel is force-closed and the
    /// error is returned to whoever joins the loop thread.
    pub fn run(&mut self) -> Result<()> {
        let timeout = Duration::from_millis(POLL_TIMEOUT_MS);
        trace!("event loop running");
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "selector failure, terminating event loop");
                self.close_all();
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                if token == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(token, readable, writable);
            }

            self.drain_tasks();

            if self.stopping {
                self.close_all();
                trace!("event loop stopped");
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        if self.acceptors.contains_key(&token) {
            if readable {
                self.accept_ready(token);
            }
            return;
        }
        if readable {
            self.channel_readable(token);
        }
        if writable {
            self.channel_writable(token);
        }
        self.after_dispatch(token);
    }

    fn drain_tasks(&mut self) {
        let drained: Vec<Task> = self.tasks.try_iter().collect();
        for task in drained {
            task(self);
        }
    }

    fn accept_ready(&mut self, token: Token) {
        if let Some(acceptor) = self.acceptors.get_mut(&token) {
            acceptor.accept_cycle();
        }
    }

    fn channel_readable(&mut self, token: Token) {
        let Some(chan) = self.channels.get_mut(&token) else {
            return;
        };
        // Backpressure: read interest disabled, leave the bytes in the
        // kernel buffer.
        if !chan.auto_read() {
            return;
        }
        let registry = self.poll.registry();
        let mut delivered = false;
        loop {
            if !chan.auto_read() || chan.is_closing() {
                break;
            }
            match chan.read(&mut self.read_buf) {
                Ok(0) => {
                    chan.begin_close();
                    break;
                }
                Ok(n) => {
                    delivered = true;
                    let data = Bytes::copy_from_slice(&self.read_buf[..n]);
                    pipeline::fire_read(chan, registry, Box::new(data));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(channel = %chan.id(), error = %e, "read failed");
                    pipeline::fire_exception(chan, registry, Error::Io(e));
                    chan.begin_close();
                    break;
                }
            }
        }
        if delivered {
            pipeline::fire_read_complete(chan, registry);
        }
        if let Err(e) = chan.flush(registry) {
            pipeline::fire_exception(chan, registry, e);
            chan.begin_close();
        }
    }

    fn channel_writable(&mut self, token: Token) {
        let Some(chan) = self.channels.get_mut(&token) else {
            return;
        };
        let registry = self.poll.registry();
        if let Err(e) = chan.flush(registry) {
            pipeline::fire_exception(chan, registry, e);
            chan.begin_close();
        }
    }

    /// Post-dispatch bookkeeping for one channel: drain reads that were
    /// re-enabled mid-dispatch, then run the close lifecycle if requested.
    fn after_dispatch(&mut self, token: Token) {
        loop {
            let resume = self
                .channels
                .get_mut(&token)
                .map(|c| c.take_resume_read())
                .unwrap_or(false);
            if !resume {
                break;
            }
            self.channel_readable(token);
        }
        let closing = self
            .channels
            .get(&token)
            .map(|c| c.is_closing())
            .unwrap_or(false);
        if closing {
            self.finalize_channel(token);
        }
    }

    fn finalize_channel(&mut self, token: Token) {
        if let Some(mut chan) = self.channels.remove(&token) {
            chan.teardown(self.poll.registry());
        }
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        for (_, mut acceptor) in self.acceptors.drain() {
            let _ = registry.deregister(acceptor.listener_mut());
        }
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            self.finalize_channel(token);
        }
    }

    fn alloc_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    // -- entry points for tasks -------------------------------------------

    /// Installs a freshly accepted connection on this loop: registers it,
    /// runs the pipeline initializer exactly once, and fires the
    /// registration/activation lifecycle.
    pub(crate) fn install_channel(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        init: Arc<Initializer>,
    ) {
        if self.stopping {
            debug!(peer = %peer, "loop stopping, dropping accepted connection");
            return;
        }
        let id = ChannelId(self.ids.fetch_add(1, Ordering::Relaxed));
        let token = self.alloc_token();
        let mut chan = Channel::accepted(id, stream, token, peer, self.handle.clone());
        let registry = self.poll.registry();
        if let Err(e) = registry.register(&mut chan.stream, token, Interest::READABLE) {
            warn!(peer = %peer, error = %e, "failed to register accepted connection");
            return;
        }
        chan.state = ChannelState::Registered;
        (*init)(&mut chan.pipeline);
        pipeline::fire_handler_added_all(&mut chan, registry);
        pipeline::fire_channel_registered(&mut chan, registry);
        chan.state = ChannelState::Active;
        debug!(channel = %id, peer = %peer, "channel active");
        pipeline::fire_channel_active(&mut chan, registry);
        if let Err(e) = chan.flush(registry) {
            pipeline::fire_exception(&mut chan, registry, e);
            chan.begin_close();
        }
        if chan.is_closing() {
            chan.teardown(registry);
            return;
        }
        self.channels.insert(token, chan);
        self.after_dispatch(token);
    }

    /// Registers an acceptor on this loop and reports the outcome through
    /// `completion`.
    pub(crate) fn register_acceptor(
        &mut self,
        mut acceptor: Acceptor,
        completion: mpsc::Sender<Result<()>>,
    ) {
        if self.stopping {
            let _ = completion.send(Err(Error::LoopShutdown));
            return;
        }
        let token = self.alloc_token();
        let local_addr = acceptor.local_addr();
        match self
            .poll
            .registry()
            .register(acceptor.listener_mut(), token, Interest::READABLE)
        {
            Ok(()) => {
                self.acceptors.insert(token, acceptor);
                info!(addr = %local_addr, "listening");
                let _ = completion.send(Ok(()));
            }
            Err(e) => {
                let _ = completion.send(Err(e.into()));
            }
        }
    }

    /// Deregisters and drops every acceptor owned by this loop. Existing
    /// channels are unaffected.
    pub fn close_acceptors(&mut self) {
        let registry = self.poll.registry();
        for (_, mut acceptor) in self.acceptors.drain() {
            let _ = registry.deregister(acceptor.listener_mut());
            debug!(addr = %acceptor.local_addr(), "acceptor closed");
        }
    }

    /// Writes through the channel's full outbound pipeline and flushes.
    /// Writes racing with teardown are dropped silently.
    pub fn channel_write(&mut self, token: Token, data: Bytes) {
        let Some(chan) = self.channels.get_mut(&token) else {
            trace!("write to closed channel dropped");
            return;
        };
        let registry = self.poll.registry();
        if let Err(e) = pipeline::submit_write(chan, registry, Box::new(data)) {
            pipeline::fire_exception(chan, registry, e);
        }
        self.after_dispatch(token);
    }

    /// Runs the outbound close operation from the pipeline tail.
    pub fn close_channel(&mut self, token: Token) {
        let Some(chan) = self.channels.get_mut(&token) else {
            return;
        };
        let registry = self.poll.registry();
        pipeline::submit_close(chan, registry);
        self.after_dispatch(token);
    }

    pub fn channel_set_auto_read(&mut self, token: Token, on: bool) {
        if let Some(chan) = self.channels.get_mut(&token) {
            chan.set_auto_read(on);
        }
        self.after_dispatch(token);
    }

    /// Delivers a user event to the channel's pipeline.
    pub fn channel_user_event(&mut self, token: Token, msg: Message) {
        let Some(chan) = self.channels.get_mut(&token) else {
            return;
        };
        let registry = self.poll.registry();
        pipeline::fire_user_event(chan, registry, msg);
        self.after_dispatch(token);
    }

    /// Splices a handler onto the tail of a live channel's pipeline and
    /// fires `handler_added`. Must run on this loop's thread (i.e. from a
    /// task).
    pub fn add_handler(&mut self, token: Token, name: &str, handler: impl Handler) {
        let Some(chan) = self.channels.get_mut(&token) else {
            debug!("add_handler on unknown channel");
            return;
        };
        let registry = self.poll.registry();
        chan.pipeline.add_last(name, handler);
        let idx = chan.pipeline.len() - 1;
        pipeline::fire_handler_added_at(chan, registry, idx);
        self.after_dispatch(token);
    }

    /// Splices a handler out of a live channel's pipeline by name and fires
    /// `handler_removed`.
    pub fn remove_handler(&mut self, token: Token, name: &str) {
        let Some(chan) = self.channels.get_mut(&token) else {
            return;
        };
        let registry = self.poll.registry();
        let Some(mut slot) = chan.pipeline.remove_slot(name) else {
            return;
        };
        pipeline::fire_removed_slot(chan, registry, &mut slot);
        self.after_dispatch(token);
    }
}

fn default_loop_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// A fixed pool of event loops, one thread each, with round-robin channel
/// assignment.
pub struct EventLoopGroup {
    handles: Vec<LoopHandle>,
    threads: Vec<JoinHandle<Result<()>>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawns `size` loops on named threads (`{name}-loop-{i}`); a size of
    /// zero means one loop per available core.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = if size == 0 { default_loop_count() } else { size };
        let ids = Arc::new(AtomicU64::new(1));
        let mut handles = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            let mut el = EventLoop::with_ids(Arc::clone(&ids))?;
            handles.push(el.handle().clone());
            let thread = thread::Builder::new()
                .name(format!("{name}-loop-{i}"))
                .spawn(move || el.run())
                .map_err(Error::Io)?;
            threads.push(thread);
        }
        info!(group = name, loops = size, "event loop group started");
        Ok(Self {
            handles,
            threads,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    /// Round-robin loop selection for new channels.
    pub fn next(&self) -> &LoopHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[i]
    }

    /// Stops every loop, joins the threads, and surfaces the first
    /// loop-fatal error if any loop died on a selector failure.
    pub fn shutdown_gracefully(&mut self) -> Result<()> {
        for handle in &self.handles {
            handle.shutdown();
        }
        let mut first_err = None;
        for thread in self.threads.drain(..) {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "event loop terminated with error");
                    first_err.get_or_insert(e);
                }
                Err(_) => error!("event loop thread panicked"),
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        let _ = self.shutdown_gracefully();
    }
}
