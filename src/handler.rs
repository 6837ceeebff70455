use crate::error::{Error, Result};
use crate::pipeline::{Context, Message};

/// A unit of per-channel processing installed into a [`Pipeline`].
///
/// One trait covers both directions: a handler that only cares about inbound
/// traffic keeps the outbound defaults (which forward), and vice versa.
/// Inbound callbacks run head-to-tail, outbound callbacks tail-to-head with
/// the socket last; propagation is explicit, via the `ctx.fire_*` methods
/// for inbound events and `ctx.write`/`ctx.flush`/`ctx.close` for outbound
/// operations. A handler that does not forward stops the event there.
///
/// All callbacks for one channel run on that channel's event-loop thread for
/// the channel's entire lifetime, so handlers need no internal locking for
/// per-channel state. Blocking inside a callback stalls every channel owned
/// by the same loop; don't.
///
/// Returning `Err` from any callback routes the error to `exception_caught`
/// on the same pipeline. The default `exception_caught` forwards, and an
/// error that falls off the tail closes the channel; a handler may consume
/// the error (by not forwarding) to keep the channel open.
///
/// [`Pipeline`]: crate::pipeline::Pipeline
#[allow(unused_variables)]
pub trait Handler: Send + 'static {
    /// Fired once, synchronously, when this handler is spliced into a
    /// pipeline, before any event can reach it.
    fn handler_added(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    /// Fired once when this handler is spliced out (or the channel is torn
    /// down), after it can no longer receive events.
    fn handler_removed(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    /// The channel has been assigned to an event loop and added to its
    /// selector.
    fn channel_registered(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// The channel is connected and ready for traffic.
    fn channel_active(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// The channel has left the active state: peer closed, local close, or
    /// an unrecoverable I/O error.
    fn channel_inactive(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// One inbound message. At the head this is a [`bytes::Bytes`] chunk as
    /// read from the socket; decoders further down the chain may forward
    /// zero or more transformed messages per input.
    fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
        ctx.fire_read(msg);
        Ok(())
    }

    /// The current burst of reads is over (the socket would block).
    fn read_complete(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_read_complete();
        Ok(())
    }

    /// An application-defined event, triggered via
    /// [`ChannelHandle::trigger_user_event`](crate::ChannelHandle::trigger_user_event).
    fn user_event(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
        ctx.fire_user_event(msg);
        Ok(())
    }

    /// An error raised by inbound or outbound processing on this channel.
    fn exception_caught(&mut self, ctx: &mut Context<'_>, err: &Error) -> Result<()> {
        ctx.fire_exception();
        Ok(())
    }

    /// Outbound message headed for the socket. Encoders transform and
    /// forward with `ctx.write`; whatever reaches the head must be
    /// [`bytes::Bytes`].
    fn write(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
        ctx.write(msg)
    }

    /// Outbound flush request; the transport drains its write queue when
    /// this reaches the head.
    fn flush(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.flush()
    }

    /// Outbound close request.
    fn close(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.close();
        Ok(())
    }
}
