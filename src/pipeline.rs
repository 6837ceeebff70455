//! Per-channel processing chain and its dispatch machinery.
//!
//! A [`Pipeline`] is an ordered sequence of named [`Handler`] slots owned by
//! exactly one channel. Slot 0 is the head (nearest the socket); the last
//! slot is the tail (nearest the application).
//!
//! ```text
//!  socket ──read──▶ [head] ──▶ [..] ──▶ [tail]      inbound events
//!  socket ◀─write── [head] ◀── [..] ◀── [tail]      outbound operations
//! ```
//!
//! Inbound events walk the slots head-to-tail; each handler decides whether
//! the event continues by calling the matching `fire_*` method on its
//! [`Context`]. Outbound operations issued by a handler walk the slots
//! between that handler and the head, tail-to-head, and reach the transport
//! last. Both directions are dispatched synchronously on the owning loop's
//! thread, which is what makes handler state lock-free.
//!
//! Messages are opaque to the core: [`Message`] is a boxed `Any`, and only
//! the transport terminal insists on [`Bytes`].

use std::any::Any;
use std::mem;
use std::net::SocketAddr;

use mio::Registry;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelHandle, ChannelId};
use crate::channel_group::ChannelGroup;
use crate::error::{Error, Result};
use crate::handler::Handler;

/// An opaque payload travelling through a pipeline.
pub type Message = Box<dyn Any + Send>;

pub(crate) struct Slot {
    name: String,
    handler: Box<dyn Handler>,
}

/// Ordered, named chain of handlers attached to one channel.
///
/// Populated by the bootstrap's pipeline initializer; at install time
/// `handler_added` fires once per slot, in order. Runtime mutation must stay
/// on the owning loop's thread and goes through
/// [`EventLoop::add_handler`](crate::EventLoop::add_handler) /
/// [`EventLoop::remove_handler`](crate::EventLoop::remove_handler), which
/// fire the lifecycle callbacks for the spliced handler.
#[derive(Default)]
pub struct Pipeline {
    slots: Vec<Slot>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Appends a handler at the tail (application side).
    pub fn add_last(&mut self, name: impl Into<String>, handler: impl Handler) {
        self.slots.push(Slot {
            name: name.into(),
            handler: Box::new(handler),
        });
    }

    /// Inserts a handler at the head (socket side).
    pub fn add_first(&mut self, name: impl Into<String>, handler: impl Handler) {
        self.slots.insert(
            0,
            Slot {
                name: name.into(),
                handler: Box::new(handler),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot names, head first.
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub(crate) fn remove_slot(&mut self, name: &str) -> Option<Slot> {
        let idx = self.slots.iter().position(|s| s.name == name)?;
        Some(self.slots.remove(idx))
    }
}

/// Borrow bundle handed to every handler callback.
///
/// Carries the channel the event belongs to, the slice of handlers between
/// the current one and the socket (the outbound chain), and the forwarding
/// sink for the dispatch in progress. Lives only for the duration of one
/// callback.
pub struct Context<'a> {
    pub(crate) chan: &'a mut Channel,
    pub(crate) registry: &'a Registry,
    chain: &'a mut [Slot],
    forward_msgs: Option<&'a mut Vec<Message>>,
    forward_flag: Option<&'a mut bool>,
}

impl<'a> Context<'a> {
    /// Cross-thread handle to this channel (cheap to clone, safe to stash).
    pub fn channel(&self) -> &ChannelHandle {
        self.chan.handle()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.chan.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.chan.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.chan.local_addr()
    }

    pub fn is_active(&self) -> bool {
        self.chan.is_active()
    }

    /// Toggles read interest for backpressure. While disabled, readable
    /// readiness is ignored and inbound bytes accumulate in the kernel
    /// receive buffer; re-enabling drains whatever is pending.
    pub fn set_auto_read(&mut self, on: bool) {
        self.chan.set_auto_read(on);
    }

    /// Forwards an inbound message to the next handler toward the tail.
    pub fn fire_read(&mut self, msg: Message) {
        self.forward(msg);
    }

    /// Forwards a user event to the next handler toward the tail.
    pub fn fire_user_event(&mut self, msg: Message) {
        self.forward(msg);
    }

    pub fn fire_channel_registered(&mut self) {
        self.forward_event();
    }

    pub fn fire_channel_active(&mut self) {
        self.forward_event();
    }

    pub fn fire_channel_inactive(&mut self) {
        self.forward_event();
    }

    pub fn fire_read_complete(&mut self) {
        self.forward_event();
    }

    /// Forwards the current error to the next `exception_caught` toward the
    /// tail. An error forwarded off the tail closes the channel.
    pub fn fire_exception(&mut self) {
        self.forward_event();
    }

    /// Sends a message toward the socket through the outbound handlers
    /// between this one and the head. The message is queued on the channel;
    /// call [`flush`](Self::flush) (or let the loop's end-of-burst flush
    /// run) to push it onto the wire.
    pub fn write(&mut self, msg: Message) -> Result<()> {
        write_through(self.chan, self.registry, self.chain, msg)
    }

    /// [`write`](Self::write) followed by [`flush`](Self::flush).
    pub fn write_and_flush(&mut self, msg: Message) -> Result<()> {
        self.write(msg)?;
        self.flush()
    }

    /// Propagates a flush toward the socket and drains the write queue as
    /// far as the socket allows.
    pub fn flush(&mut self) -> Result<()> {
        flush_through(self.chan, self.registry, self.chain)
    }

    /// Initiates channel close. Idempotent; the full teardown (one
    /// `channel_inactive`, reverse-order `handler_removed`, group removal)
    /// runs after the current dispatch unwinds.
    pub fn close(&mut self) {
        close_through(self.chan, self.registry, self.chain);
    }

    pub(crate) fn join_group(&mut self, group: ChannelGroup) {
        self.chan.joined_groups.push(group);
    }

    fn forward(&mut self, msg: Message) {
        match self.forward_msgs.as_deref_mut() {
            Some(sink) => sink.push(msg),
            None => debug!("message forwarded outside an inbound dispatch, dropped"),
        }
    }

    fn forward_event(&mut self) {
        if let Some(flag) = self.forward_flag.as_deref_mut() {
            *flag = true;
        }
    }
}

fn event_ctx<'a>(chan: &'a mut Channel, registry: &'a Registry, chain: &'a mut [Slot]) -> Context<'a> {
    Context {
        chan,
        registry,
        chain,
        forward_msgs: None,
        forward_flag: None,
    }
}

// ---------------------------------------------------------------------------
// Outbound: recursive walk toward the head, transport last.
// ---------------------------------------------------------------------------

fn write_through(
    chan: &mut Channel,
    registry: &Registry,
    chain: &mut [Slot],
    msg: Message,
) -> Result<()> {
    match chain.split_last_mut() {
        Some((slot, front)) => {
            let mut ctx = event_ctx(chan, registry, front);
            slot.handler.write(&mut ctx, msg)
        }
        None => chan.enqueue_outbound(msg),
    }
}

fn flush_through(chan: &mut Channel, registry: &Registry, chain: &mut [Slot]) -> Result<()> {
    match chain.split_last_mut() {
        Some((slot, front)) => {
            let mut ctx = event_ctx(chan, registry, front);
            slot.handler.flush(&mut ctx)
        }
        None => chan.flush(registry),
    }
}

fn close_through(chan: &mut Channel, registry: &Registry, chain: &mut [Slot]) {
    match chain.split_last_mut() {
        Some((slot, front)) => {
            let mut ctx = event_ctx(chan, registry, front);
            if let Err(e) = slot.handler.close(&mut ctx) {
                warn!(handler = %slot.name, error = %e, "close handler failed, forcing close");
                chan.begin_close();
            }
        }
        None => chan.begin_close(),
    }
}

// ---------------------------------------------------------------------------
// Inbound: iterative walk toward the tail.
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum EventOp {
    Registered,
    Active,
    Inactive,
    ReadComplete,
}

#[derive(Clone, Copy)]
enum MessageOp {
    Read,
    UserEvent,
}

/// Takes the slot list out of the pipeline for the duration of a dispatch,
/// so handlers can borrow the channel mutably, and splices back anything
/// added meanwhile.
fn with_slots<R>(chan: &mut Channel, f: impl FnOnce(&mut Channel, &mut Vec<Slot>) -> R) -> R {
    let mut slots = mem::take(&mut chan.pipeline.slots);
    let out = f(chan, &mut slots);
    let added = mem::replace(&mut chan.pipeline.slots, slots);
    chan.pipeline.slots.extend(added);
    out
}

fn drive_event(
    chan: &mut Channel,
    registry: &Registry,
    slots: &mut [Slot],
    op: EventOp,
) -> Result<()> {
    for i in 0..slots.len() {
        let (head, rest) = slots.split_at_mut(i);
        let slot = match rest.first_mut() {
            Some(s) => s,
            None => break,
        };
        let mut forward = false;
        let mut ctx = Context {
            chan: &mut *chan,
            registry,
            chain: head,
            forward_msgs: None,
            forward_flag: Some(&mut forward),
        };
        match op {
            EventOp::Registered => slot.handler.channel_registered(&mut ctx)?,
            EventOp::Active => slot.handler.channel_active(&mut ctx)?,
            EventOp::Inactive => slot.handler.channel_inactive(&mut ctx)?,
            EventOp::ReadComplete => slot.handler.read_complete(&mut ctx)?,
        }
        if !forward {
            break;
        }
    }
    Ok(())
}

fn drive_messages(
    chan: &mut Channel,
    registry: &Registry,
    slots: &mut [Slot],
    first: Message,
    op: MessageOp,
) -> Result<()> {
    let mut batch = vec![first];
    for i in 0..slots.len() {
        if batch.is_empty() {
            return Ok(());
        }
        let (head, rest) = slots.split_at_mut(i);
        let slot = match rest.first_mut() {
            Some(s) => s,
            None => break,
        };
        let mut next = Vec::new();
        for msg in batch.drain(..) {
            let mut ctx = Context {
                chan: &mut *chan,
                registry,
                chain: &mut *head,
                forward_msgs: Some(&mut next),
                forward_flag: None,
            };
            match op {
                MessageOp::Read => slot.handler.channel_read(&mut ctx, msg)?,
                MessageOp::UserEvent => slot.handler.user_event(&mut ctx, msg)?,
            }
        }
        batch = next;
    }
    if !batch.is_empty() {
        debug!(
            channel = %chan.id(),
            count = batch.len(),
            "inbound messages reached the pipeline tail unhandled"
        );
    }
    Ok(())
}

fn run_event(chan: &mut Channel, registry: &Registry, op: EventOp) {
    let result = with_slots(chan, |chan, slots| drive_event(chan, registry, slots, op));
    if let Err(e) = result {
        fire_exception(chan, registry, e);
    }
}

fn run_messages(chan: &mut Channel, registry: &Registry, first: Message, op: MessageOp) {
    let result = with_slots(chan, |chan, slots| {
        drive_messages(chan, registry, slots, first, op)
    });
    if let Err(e) = result {
        fire_exception(chan, registry, e);
    }
}

// ---------------------------------------------------------------------------
// Entry points used by the event loop and the channel lifecycle.
// ---------------------------------------------------------------------------

pub(crate) fn fire_channel_registered(chan: &mut Channel, registry: &Registry) {
    run_event(chan, registry, EventOp::Registered);
}

pub(crate) fn fire_channel_active(chan: &mut Channel, registry: &Registry) {
    run_event(chan, registry, EventOp::Active);
}

pub(crate) fn fire_channel_inactive(chan: &mut Channel, registry: &Registry) {
    run_event(chan, registry, EventOp::Inactive);
}

pub(crate) fn fire_read_complete(chan: &mut Channel, registry: &Registry) {
    run_event(chan, registry, EventOp::ReadComplete);
}

pub(crate) fn fire_read(chan: &mut Channel, registry: &Registry, msg: Message) {
    run_messages(chan, registry, msg, MessageOp::Read);
}

pub(crate) fn fire_user_event(chan: &mut Channel, registry: &Registry, msg: Message) {
    run_messages(chan, registry, msg, MessageOp::UserEvent);
}

/// Routes an error through `exception_caught` head-to-tail. If every handler
/// forwards (or a handler fails while handling it), the default policy
/// applies: the channel is closed.
pub(crate) fn fire_exception(chan: &mut Channel, registry: &Registry, err: Error) {
    let handled = with_slots(chan, |chan, slots| {
        for i in 0..slots.len() {
            let (head, rest) = slots.split_at_mut(i);
            let slot = match rest.first_mut() {
                Some(s) => s,
                None => break,
            };
            let mut forward = false;
            let mut ctx = Context {
                chan: &mut *chan,
                registry,
                chain: head,
                forward_msgs: None,
                forward_flag: Some(&mut forward),
            };
            let res = slot.handler.exception_caught(&mut ctx, &err);
            if let Err(nested) = res {
                warn!(handler = %slot.name, error = %nested, "exception handler failed");
                return false;
            }
            if !forward {
                return true;
            }
        }
        false
    });
    if !handled {
        warn!(channel = %chan.id(), error = %err, "unhandled exception, closing channel");
        chan.begin_close();
    }
}

/// Fires `handler_added` for every installed slot, head first. Used once at
/// channel installation, after the initializer has populated the pipeline.
pub(crate) fn fire_handler_added_all(chan: &mut Channel, registry: &Registry) {
    for i in 0..chan.pipeline.slots.len() {
        fire_handler_added_at(chan, registry, i);
    }
}

pub(crate) fn fire_handler_added_at(chan: &mut Channel, registry: &Registry, idx: usize) {
    let failure = with_slots(chan, |chan, slots| {
        if idx >= slots.len() {
            return None;
        }
        let (head, rest) = slots.split_at_mut(idx);
        let slot = match rest.first_mut() {
            Some(s) => s,
            None => return None,
        };
        let mut ctx = event_ctx(chan, registry, head);
        slot.handler.handler_added(&mut ctx).err()
    });
    if let Some(e) = failure {
        fire_exception(chan, registry, e);
    }
}

/// Fires `handler_removed` for a single slot that has already been spliced
/// out of the chain.
pub(crate) fn fire_removed_slot(chan: &mut Channel, registry: &Registry, slot: &mut Slot) {
    let mut rest: [Slot; 0] = [];
    let mut ctx = event_ctx(chan, registry, &mut rest);
    if let Err(e) = slot.handler.handler_removed(&mut ctx) {
        warn!(handler = %slot.name, error = %e, "handler_removed failed");
    }
}

/// Tears the whole chain down, tail first (reverse installation order).
/// Failures here are logged, not propagated; the channel is closing anyway.
pub(crate) fn fire_handler_removed_all(chan: &mut Channel, registry: &Registry) {
    let mut slots = mem::take(&mut chan.pipeline.slots);
    while let Some(mut slot) = slots.pop() {
        fire_removed_slot(chan, registry, &mut slot);
    }
}

/// Full-chain outbound write + flush, entered from the tail. This is the
/// path cross-thread writes take once their task reaches the owning loop.
pub(crate) fn submit_write(chan: &mut Channel, registry: &Registry, msg: Message) -> Result<()> {
    with_slots(chan, |chan, slots| {
        write_through(chan, registry, slots, msg)?;
        flush_through(chan, registry, slots)
    })
}

/// Full-chain outbound close, entered from the tail.
pub(crate) fn submit_close(chan: &mut Channel, registry: &Registry) {
    with_slots(chan, |chan, slots| close_through(chan, registry, slots));
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::channel::testing::channel_fixture;
    use crate::error::Error;

    #[derive(Clone, Default)]
    struct Trace(Arc<Mutex<Vec<String>>>);

    impl Trace {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().unwrap().push(s.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    struct Recorder {
        tag: &'static str,
        trace: Trace,
    }

    impl Handler for Recorder {
        fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
            self.trace.push(format!("{}:read", self.tag));
            ctx.fire_read(msg);
            Ok(())
        }

        fn channel_active(&mut self, ctx: &mut Context<'_>) -> Result<()> {
            self.trace.push(format!("{}:active", self.tag));
            ctx.fire_channel_active();
            Ok(())
        }

        fn write(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
            self.trace.push(format!("{}:write", self.tag));
            ctx.write(msg)
        }

        fn handler_removed(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
            self.trace.push(format!("{}:removed", self.tag));
            Ok(())
        }
    }

    /// Swallows every read without forwarding.
    struct Sink {
        trace: Trace,
    }

    impl Handler for Sink {
        fn channel_read(&mut self, _ctx: &mut Context<'_>, _msg: Message) -> Result<()> {
            self.trace.push("sink:read");
            Ok(())
        }
    }

    #[test]
    fn inbound_events_run_head_to_tail() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        let trace = Trace::default();
        chan.pipeline.add_last(
            "a",
            Recorder {
                tag: "a",
                trace: trace.clone(),
            },
        );
        chan.pipeline.add_last(
            "b",
            Recorder {
                tag: "b",
                trace: trace.clone(),
            },
        );

        fire_channel_active(&mut chan, poll.registry());
        assert_eq!(trace.take(), vec!["a:active", "b:active"]);

        fire_read(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"x")));
        assert_eq!(trace.take(), vec!["a:read", "b:read"]);
    }

    #[test]
    fn consuming_handler_stops_propagation() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        let trace = Trace::default();
        chan.pipeline.add_last(
            "sink",
            Sink {
                trace: trace.clone(),
            },
        );
        chan.pipeline.add_last(
            "after",
            Recorder {
                tag: "after",
                trace: trace.clone(),
            },
        );

        fire_read(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"x")));
        assert_eq!(trace.take(), vec!["sink:read"]);
    }

    #[test]
    fn outbound_writes_run_tail_to_head_and_reach_the_queue() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        let trace = Trace::default();
        chan.pipeline.add_last(
            "a",
            Recorder {
                tag: "a",
                trace: trace.clone(),
            },
        );
        chan.pipeline.add_last(
            "b",
            Recorder {
                tag: "b",
                trace: trace.clone(),
            },
        );

        // Writing from the tail passes b, then a, then hits the transport.
        let res = submit_write(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"hi")));
        assert!(res.is_ok());
        assert_eq!(trace.take(), vec!["b:write", "a:write"]);
    }

    #[test]
    fn non_bytes_at_the_transport_is_rejected() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        let res = submit_write(&mut chan, poll.registry(), Box::new("not bytes".to_string()));
        assert!(matches!(res, Err(Error::UnsupportedMessage)));
    }

    #[test]
    fn decoder_transforms_and_forwards() {
        struct Upcase;
        impl Handler for Upcase {
            fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
                let data = msg.downcast::<Bytes>().expect("bytes at head");
                let text = String::from_utf8(data.to_vec())
                    .map_err(|e| Error::Decode(e.to_string()))?;
                ctx.fire_read(Box::new(text.to_uppercase()));
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        struct Tail(Arc<Mutex<Vec<String>>>);
        impl Handler for Tail {
            fn channel_read(&mut self, _ctx: &mut Context<'_>, msg: Message) -> Result<()> {
                let text = msg.downcast::<String>().expect("decoded string");
                self.0.lock().unwrap().push(*text);
                Ok(())
            }
        }

        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("decode", Upcase);
        chan.pipeline.add_last("tail", Tail(seen.clone()));

        fire_read(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"hi")));
        assert_eq!(*seen.lock().unwrap(), vec!["HI".to_string()]);
    }

    #[test]
    fn handler_error_routes_to_exception_and_closes_by_default() {
        struct Failing;
        impl Handler for Failing {
            fn channel_read(&mut self, _ctx: &mut Context<'_>, _msg: Message) -> Result<()> {
                Err(Error::Handler("boom".into()))
            }
        }

        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("failing", Failing);

        fire_read(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"x")));
        assert!(chan.is_closing());
    }

    #[test]
    fn consumed_exception_keeps_the_channel_open() {
        struct Failing;
        impl Handler for Failing {
            fn channel_read(&mut self, _ctx: &mut Context<'_>, _msg: Message) -> Result<()> {
                Err(Error::Handler("boom".into()))
            }
        }
        struct Recovering;
        impl Handler for Recovering {
            fn exception_caught(&mut self, _ctx: &mut Context<'_>, _err: &Error) -> Result<()> {
                // consume: do not forward
                Ok(())
            }
        }

        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("recover", Recovering);
        chan.pipeline.add_last("failing", Failing);

        fire_read(&mut chan, poll.registry(), Box::new(Bytes::from_static(b"x")));
        assert!(!chan.is_closing());
    }

    #[test]
    fn user_events_travel_head_to_tail_like_reads() {
        struct Kick;

        let seen = Arc::new(Mutex::new(0u32));
        struct Tail(Arc<Mutex<u32>>);
        impl Handler for Tail {
            fn user_event(&mut self, _ctx: &mut Context<'_>, msg: Message) -> Result<()> {
                if msg.downcast::<Kick>().is_ok() {
                    *self.0.lock().unwrap() += 1;
                }
                Ok(())
            }
        }

        let (mut chan, _peer, poll, _el) = channel_fixture();
        let trace = Trace::default();
        chan.pipeline.add_last(
            "head",
            Recorder {
                tag: "head",
                trace: trace.clone(),
            },
        );
        chan.pipeline.add_last("tail", Tail(seen.clone()));

        fire_user_event(&mut chan, poll.registry(), Box::new(Kick));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn handler_removed_fires_in_reverse_order() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        let trace = Trace::default();
        chan.pipeline.add_last(
            "a",
            Recorder {
                tag: "a",
                trace: trace.clone(),
            },
        );
        chan.pipeline.add_last(
            "b",
            Recorder {
                tag: "b",
                trace: trace.clone(),
            },
        );

        fire_handler_removed_all(&mut chan, poll.registry());
        assert_eq!(trace.take(), vec!["b:removed", "a:removed"]);
        assert!(chan.pipeline.is_empty());
    }
}
