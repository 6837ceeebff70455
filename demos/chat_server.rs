//! Group chat server.
//!
//! Every connected client is a member of one chat group. A line sent by any
//! member is relayed to every other member (prefixed `[relay]`) and echoed
//! back to the sender (prefixed `[echo]`); joins and leaves are announced to
//! the rest of the group. Try it with a few `nc 127.0.0.1 8888` sessions.

use anyhow::Result;
use bytes::Bytes;
use tracing::info;

use spindle::prelude::*;

struct ChatHandler {
    group: ChannelGroup,
}

impl Handler for ChatHandler {
    fn channel_active(&mut self, ctx: &mut Context<'_>) -> spindle::Result<()> {
        let addr = ctx.remote_addr();
        info!(peer = %addr, "client joined");
        self.group
            .write_and_flush(Bytes::from(format!("[chat] {addr} joined\n")));
        self.group.add(ctx);
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &mut Context<'_>) -> spindle::Result<()> {
        let addr = ctx.remote_addr();
        info!(peer = %addr, "client left");
        self.group.write_and_flush_except(
            Bytes::from(format!("[chat] {addr} left\n")),
            ctx.channel_id(),
        );
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&mut self, ctx: &mut Context<'_>, msg: Message) -> spindle::Result<()> {
        let Ok(text) = msg.downcast::<String>() else {
            return Ok(());
        };
        self.group.write_and_flush_except(
            Bytes::from(format!("[relay] {text}")),
            ctx.channel_id(),
        );
        ctx.write_and_flush(Box::new(format!("[echo] {text}")))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let boss = EventLoopGroup::new("boss", 1)?;
    let workers = EventLoopGroup::new("worker", 0)?;
    let group = ChannelGroup::new("chat");

    let config = ServerConfig::builder()
        .address("127.0.0.1:8888".parse()?)
        .build();

    let server = ServerBootstrap::bind(config, &boss, &workers, move |pipeline| {
        pipeline.add_last("decoder", StringDecoder);
        pipeline.add_last("encoder", StringEncoder);
        pipeline.add_last(
            "chat",
            ChatHandler {
                group: group.clone(),
            },
        );
    })?
    .wait()?;

    info!(addr = %server.local_addr(), "chat server up");
    loop {
        std::thread::park();
    }
}
