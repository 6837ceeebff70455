//! Cross-loop channel collections for broadcast.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use lockfree::map::Map;
use tracing::trace;

use crate::channel::{ChannelHandle, ChannelId};
use crate::pipeline::Context;

/// A named set of channels, possibly owned by different event loops, that
/// can be written to as one.
///
/// Cloning is cheap and every clone refers to the same membership. Channels
/// register the groups they join, so a channel's own close removes it from
/// every group without the application doing anything.
///
/// A broadcast captures a snapshot of the membership and submits one write
/// task per member to that member's own loop, so each channel's bytes are
/// still written only by its owning thread. Members that close between the
/// snapshot and the task running are skipped silently; members that join
/// after the snapshot miss that broadcast.
#[derive(Clone)]
pub struct ChannelGroup {
    name: Arc<str>,
    members: Arc<Map<u64, ChannelHandle>>,
}

impl ChannelGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            members: Arc::new(Map::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds the channel behind `ctx` to the group and registers the group
    /// with the channel for removal on close. Loop-thread only, like all
    /// pipeline callbacks.
    pub fn add(&self, ctx: &mut Context<'_>) {
        let handle = ctx.channel().clone();
        trace!(group = %self.name, channel = %handle.id(), "joined group");
        self.members.insert(handle.id().as_u64(), handle);
        ctx.join_group(self.clone());
    }

    pub fn remove(&self, id: ChannelId) {
        if self.members.remove(&id.as_u64()).is_some() {
            trace!(group = %self.name, channel = %id, "left group");
        }
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.members.get(&id.as_u64()).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.members.iter().next().is_none()
    }

    /// A point-in-time snapshot of the membership.
    pub fn members(&self) -> Vec<ChannelHandle> {
        self.members.iter().map(|entry| entry.val().clone()).collect()
    }

    /// Writes `data` through every member's outbound pipeline and flushes.
    /// Delivery is at-least-attempted per snapshot member; channels whose
    /// loop is gone or that closed in the meantime are dropped silently.
    pub fn write_and_flush(&self, data: Bytes) {
        for member in self.members() {
            let _ = member.write_and_flush(data.clone());
        }
    }

    /// Same as [`write_and_flush`](Self::write_and_flush), but skips the
    /// member with the given id. The common relay shape: everyone but the
    /// sender.
    pub fn write_and_flush_except(&self, data: Bytes, except: ChannelId) {
        for member in self.members() {
            if member.id() == except {
                continue;
            }
            let _ = member.write_and_flush(data.clone());
        }
    }
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
