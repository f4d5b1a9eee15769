//! Asynchronous message delivery between blocks
//!
//! Messages bypass the stream buffers entirely: every block owns an unbounded
//! inbox channel, and message edges become subscriptions from a source port
//! to a destination block's inbox.

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::trace;

use super::block::BlockRef;
use super::tag::TagValue;

/// Messages a block wants to publish, keyed by its output message port
#[derive(Debug, Default)]
pub struct MessageOutbox {
    pending: Vec<(String, TagValue)>,
}

impl MessageOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `msg` on output message port `port`
    pub fn post(&mut self, port: impl Into<String>, msg: TagValue) {
        self.pending.push((port.into(), msg));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn take(&mut self) -> Vec<(String, TagValue)> {
        std::mem::take(&mut self.pending)
    }
}

/// A block's incoming message queue
pub(crate) struct MessageInbox {
    tx: Sender<(String, TagValue)>,
    rx: Receiver<(String, TagValue)>,
}

impl MessageInbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub(crate) fn send(&self, port: &str, msg: TagValue) {
        // Both ends live in the same struct, so the channel never disconnects.
        let _ = self.tx.send((port.to_string(), msg));
    }

    pub(crate) fn try_recv(&self) -> Option<(String, TagValue)> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// A message edge as seen from its source port
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub(crate) dest: BlockRef,
    pub(crate) port: String,
}

/// Output message port -> subscribers
pub(crate) type Subscribers = BTreeMap<String, Vec<Subscription>>;

/// Deliver everything in `outbox` to the subscribers of each port
pub(crate) fn publish(src: &str, subscribers: &Subscribers, outbox: &mut MessageOutbox) {
    for (port, msg) in outbox.take() {
        match subscribers.get(&port) {
            Some(subs) => {
                for sub in subs {
                    sub.dest.post(&sub.port, msg.clone());
                }
            }
            None => trace!("[{}] message on unconnected port '{}' dropped", src, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_take_empties() {
        let mut outbox = MessageOutbox::new();
        outbox.post("out", TagValue::Int(1));
        outbox.post("out", TagValue::Int(2));
        assert_eq!(outbox.len(), 2);
        let taken = outbox.take();
        assert_eq!(taken[1], ("out".to_string(), TagValue::Int(2)));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_inbox_fifo() {
        let inbox = MessageInbox::new();
        inbox.send("in", TagValue::from("a"));
        inbox.send("in", TagValue::from("b"));
        assert_eq!(inbox.try_recv().map(|(_, m)| m), Some(TagValue::from("a")));
        assert_eq!(inbox.try_recv().map(|(_, m)| m), Some(TagValue::from("b")));
        assert!(inbox.try_recv().is_none());
        assert!(inbox.is_empty());
    }
}
