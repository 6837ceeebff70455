//! Text codec handlers.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::pipeline::{Context, Message};

/// Decodes inbound [`Bytes`] chunks into `String` messages.
///
/// Each socket read burst is decoded as one message; a payload that is not
/// valid UTF-8 is a connection-fatal decode error. Non-byte payloads (from
/// a handler installed closer to the head) pass through untouched.
#[derive(Debug, Default)]
pub struct StringDecoder;

impl Handler for StringDecoder {
    fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
        let msg = match msg.downcast::<Bytes>() {
            Ok(data) => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|e| Error::Decode(format!("invalid utf-8: {e}")))?;
                Box::new(text) as Message
            }
            Err(other) => other,
        };
        ctx.fire_read(msg);
        Ok(())
    }
}

/// Encodes outbound `String` messages into [`Bytes`] for the transport.
/// Payloads that are already something else pass through for the next
/// outbound handler (or the transport) to deal with.
#[derive(Debug, Default)]
pub struct StringEncoder;

impl Handler for StringEncoder {
    fn write(&mut self, ctx: &mut Context<'_>, msg: Message) -> Result<()> {
        let msg = match msg.downcast::<String>() {
            Ok(text) => Box::new(Bytes::from(text.into_bytes())) as Message,
            Err(other) => other,
        };
        ctx.write(msg)
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::testing::channel_fixture;
    use crate::pipeline;

    use super::*;

    #[test]
    fn decoder_emits_strings_and_rejects_bad_utf8() {
        use std::sync::{Arc, Mutex};

        struct Collect(Arc<Mutex<Vec<String>>>);
        impl Handler for Collect {
            fn channel_read(&mut self, _ctx: &mut Context<'_>, msg: Message) -> Result<()> {
                if let Ok(text) = msg.downcast::<String>() {
                    self.0.lock().unwrap().push(*text);
                }
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("decoder", StringDecoder);
        chan.pipeline.add_last("collect", Collect(seen.clone()));

        pipeline::fire_read(
            &mut chan,
            poll.registry(),
            Box::new(Bytes::from_static(b"hello")),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);

        // Invalid UTF-8 is an error, routed to exception handling; the
        // default disposition closes the channel.
        pipeline::fire_read(
            &mut chan,
            poll.registry(),
            Box::new(Bytes::from_static(&[0xff, 0xfe])),
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(chan.is_closing());
    }

    #[test]
    fn encoder_turns_strings_into_wire_bytes() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("encoder", StringEncoder);

        pipeline::submit_write(&mut chan, poll.registry(), Box::new("ping".to_string()))
            .expect("write");
        // submit_write flushes; the bytes either hit the socket or sit in
        // the queue, never error.
        assert!(!chan.is_closing());
    }

    #[test]
    fn encoder_passes_foreign_payloads_through() {
        let (mut chan, _peer, poll, _el) = channel_fixture();
        chan.pipeline.add_last("encoder", StringEncoder);

        // A u32 is not a String; the encoder forwards it untouched and the
        // transport rejects it.
        let res = pipeline::submit_write(&mut chan, poll.registry(), Box::new(7u32));
        assert!(matches!(res, Err(Error::UnsupportedMessage)));
    }
}
