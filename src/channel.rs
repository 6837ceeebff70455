//! One connected socket and its lifecycle.
//!
//! A [`Channel`] owns its socket, its FIFO write queue and its pipeline, and
//! is bound to exactly one event loop for its whole life; only that loop's
//! thread ever touches it. Everything another thread may do to a channel
//! goes through the cloneable [`ChannelHandle`], which expresses the
//! operation as a task submitted to the owning loop.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::channel_group::ChannelGroup;
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::pipeline::{self, Message, Pipeline};

/// Identity of a channel, unique across every loop in the owning group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel lifecycle.
///
/// `Unregistered → Registered → Active → Inactive → Closed`, with a direct
/// jump to `Closed` only when a fatal error strikes before the channel ever
/// became active. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registered,
    Active,
    Inactive,
    Closed,
}

pub struct Channel {
    id: ChannelId,
    pub(crate) stream: TcpStream,
    pub(crate) token: Token,
    pub(crate) state: ChannelState,
    pub(crate) pipeline: Pipeline,
    pub(crate) joined_groups: Vec<ChannelGroup>,
    handle: ChannelHandle,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
    out_queue: VecDeque<Bytes>,
    auto_read: bool,
    resume_read: bool,
    want_write: bool,
    pending_close: bool,
}

impl Channel {
    pub(crate) fn accepted(
        id: ChannelId,
        stream: TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        loop_handle: LoopHandle,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        Self {
            id,
            handle: ChannelHandle {
                id,
                token,
                peer_addr,
                loop_handle,
            },
            stream,
            token,
            state: ChannelState::Unregistered,
            pipeline: Pipeline::new(),
            joined_groups: Vec::new(),
            local_addr,
            peer_addr,
            out_queue: VecDeque::new(),
            auto_read: true,
            resume_read: false,
            want_write: false,
            pending_close: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// Toggles read interest. Turning it back on requests a drain pass so
    /// bytes that piled up in the kernel buffer are delivered promptly.
    pub fn set_auto_read(&mut self, on: bool) {
        if on && !self.auto_read {
            self.resume_read = true;
        }
        self.auto_read = on;
    }

    pub(crate) fn take_resume_read(&mut self) -> bool {
        std::mem::take(&mut self.resume_read)
    }

    /// Marks the channel for teardown. Idempotent; a no-op once closing or
    /// closed.
    pub(crate) fn begin_close(&mut self) {
        if self.state != ChannelState::Closed {
            self.pending_close = true;
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.pending_close && self.state != ChannelState::Closed
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Terminal of the outbound pipeline: only byte buffers may reach the
    /// socket.
    pub(crate) fn enqueue_outbound(&mut self, msg: Message) -> Result<()> {
        match msg.downcast::<Bytes>() {
            Ok(data) => {
                if !data.is_empty() {
                    self.out_queue.push_back(*data);
                }
                Ok(())
            }
            Err(_) => Err(Error::UnsupportedMessage),
        }
    }

    pub(crate) fn pending_write_bytes(&self) -> usize {
        self.out_queue.iter().map(Bytes::len).sum()
    }

    /// Drains the write queue in FIFO order until it is empty or the socket
    /// would block, in which case writable interest is armed and the drain
    /// resumes on the next writable readiness event.
    pub(crate) fn flush(&mut self, registry: &Registry) -> Result<()> {
        while let Some(front) = self.out_queue.front_mut() {
            match self.stream.write(front.chunk()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket write returned zero",
                    )
                    .into())
                }
                Ok(n) => {
                    front.advance(n);
                    if !front.has_remaining() {
                        self.out_queue.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.arm_write(registry)?;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.disarm_write(registry)?;
        Ok(())
    }

    fn arm_write(&mut self, registry: &Registry) -> Result<()> {
        if !self.want_write {
            self.want_write = true;
            registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            trace!(channel = %self.id, "writable interest armed");
        }
        Ok(())
    }

    fn disarm_write(&mut self, registry: &Registry) -> Result<()> {
        if self.want_write {
            self.want_write = false;
            registry.reregister(&mut self.stream, self.token, Interest::READABLE)?;
        }
        Ok(())
    }

    /// Runs the close lifecycle to completion: at most one
    /// `channel_inactive`, `handler_removed` in reverse installation order,
    /// deregistration, and removal from every joined group. Safe to call
    /// more than once; only the first call does anything. Queued bytes that
    /// never made it onto the wire are discarded.
    pub(crate) fn teardown(&mut self, registry: &Registry) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.pending_close = true;
        if self.state == ChannelState::Active {
            self.state = ChannelState::Inactive;
            pipeline::fire_channel_inactive(self, registry);
        }
        self.state = ChannelState::Closed;
        let _ = registry.deregister(&mut self.stream);
        pipeline::fire_handler_removed_all(self, registry);
        for group in std::mem::take(&mut self.joined_groups) {
            group.remove(self.id);
        }
        self.out_queue.clear();
        debug!(channel = %self.id, peer = %self.peer_addr, "channel closed");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer_addr)
            .field("pending_writes", &self.out_queue.len())
            .finish()
    }
}

/// Cross-thread reference to a channel: membership identity plus the
/// operations that are legal from any thread.
///
/// Every operation is message-passing: it submits a task to the owning
/// loop, preserving the single-writer invariant for the channel's state.
/// Operations racing with channel teardown are dropped silently once the
/// channel is gone.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    token: Token,
    peer_addr: SocketAddr,
    loop_handle: LoopHandle,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Queues `data` through the channel's outbound pipeline (from the
    /// tail) and flushes. Returns `Err` only if the owning loop is shut
    /// down; a channel that closed in the meantime swallows the write.
    pub fn write_and_flush(&self, data: Bytes) -> Result<()> {
        let token = self.token;
        self.loop_handle
            .submit(move |el| el.channel_write(token, data))
    }

    /// Requests the close lifecycle on the owning loop. Idempotent.
    pub fn close(&self) -> Result<()> {
        let token = self.token;
        self.loop_handle.submit(move |el| el.close_channel(token))
    }

    /// Toggles read interest (backpressure) from any thread.
    pub fn set_auto_read(&self, on: bool) -> Result<()> {
        let token = self.token;
        self.loop_handle
            .submit(move |el| el.channel_set_auto_read(token, on))
    }

    /// Delivers an application-defined event to the channel's pipeline.
    pub fn trigger_user_event(&self, msg: Message) -> Result<()> {
        let token = self.token;
        self.loop_handle
            .submit(move |el| el.channel_user_event(token, msg))
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::event_loop::EventLoop;
    use mio::Poll;

    /// A real connected socket pair wrapped into a `Channel`, plus the peer
    /// end for asserting on wire bytes. The returned `EventLoop` is never
    /// run; it only backs the handle so cross-thread ops have somewhere to
    /// go.
    pub(crate) fn channel_fixture() -> (Channel, std::net::TcpStream, Poll, EventLoop) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = std::net::TcpStream::connect(listener.local_addr().expect("addr"))
            .expect("connect");
        let (accepted, peer_addr) = listener.accept().expect("accept");
        accepted.set_nonblocking(true).expect("nonblocking");
        let stream = TcpStream::from_std(accepted);

        let el = EventLoop::new().expect("event loop");
        let poll = Poll::new().expect("poll");
        let chan = Channel::accepted(
            ChannelId(1),
            stream,
            Token(1),
            peer_addr,
            el.handle().clone(),
        );
        (chan, peer, poll, el)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use super::testing::channel_fixture;
    use super::*;

    #[test]
    fn writes_flush_in_fifo_order() {
        let (mut chan, mut peer, poll, _el) = channel_fixture();
        for part in ["first ", "second ", "third"] {
            chan.enqueue_outbound(Box::new(Bytes::from(part)))
                .expect("enqueue");
        }
        chan.flush(poll.registry()).expect("flush");
        assert_eq!(chan.pending_write_bytes(), 0);

        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        while got.len() < "first second third".len() {
            let n = peer.read(&mut buf).expect("peer read");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"first second third");
    }

    #[test]
    fn non_bytes_payload_is_rejected_at_the_transport() {
        let (mut chan, _peer, _poll, _el) = channel_fixture();
        let res = chan.enqueue_outbound(Box::new(42u32));
        assert!(matches!(res, Err(Error::UnsupportedMessage)));
    }

    #[test]
    fn teardown_is_idempotent() {
        use crate::handler::Handler;
        use crate::pipeline::Context;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counting {
            inactive: Arc<AtomicUsize>,
            removed: Arc<AtomicUsize>,
        }
        impl Handler for Counting {
            fn channel_inactive(&mut self, ctx: &mut Context<'_>) -> crate::Result<()> {
                self.inactive.fetch_add(1, Ordering::SeqCst);
                ctx.fire_channel_inactive();
                Ok(())
            }
            fn handler_removed(&mut self, _ctx: &mut Context<'_>) -> crate::Result<()> {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let inactive = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last(
            "counting",
            Counting {
                inactive: inactive.clone(),
                removed: removed.clone(),
            },
        );
        chan.state = ChannelState::Active;

        chan.teardown(poll.registry());
        chan.teardown(poll.registry());
        assert_eq!(chan.state(), ChannelState::Closed);
        assert_eq!(inactive.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_before_active_skips_inactive() {
        use crate::handler::Handler;
        use crate::pipeline::Context;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counting(Arc<AtomicUsize>);
        impl Handler for Counting {
            fn channel_inactive(&mut self, ctx: &mut Context<'_>) -> crate::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                ctx.fire_channel_inactive();
                Ok(())
            }
        }

        let inactive = Arc::new(AtomicUsize::new(0));
        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("counting", Counting(inactive.clone()));
        chan.state = ChannelState::Registered;

        chan.teardown(poll.registry());
        assert_eq!(chan.state(), ChannelState::Closed);
        assert_eq!(inactive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auto_read_toggle_requests_resume() {
        let (mut chan, _peer, _poll, _el) = channel_fixture();
        assert!(chan.auto_read());
        chan.set_auto_read(false);
        assert!(!chan.take_resume_read());
        chan.set_auto_read(true);
        assert!(chan.take_resume_read());
        assert!(!chan.take_resume_read());
    }
}
