//! Message-only blocks

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::runtime::block::{Block, BlockMeta, WorkError, WorkIo, WorkResult, WorkReturn};
use crate::runtime::messages::MessageOutbox;
use crate::runtime::tag::TagValue;

/// Publishes a message on port `strobe` every `period`
///
/// A message on input port `set_msg` replaces the payload.
pub struct MessageStrobe {
    name: String,
    msg: TagValue,
    period: Duration,
    next_fire: Option<Instant>,
    limit: Option<u64>,
    sent: u64,
}

impl MessageStrobe {
    pub fn new(msg: TagValue, period: Duration) -> Self {
        Self {
            name: "message_strobe".to_string(),
            msg,
            period,
            next_fire: None,
            limit: None,
            sent: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Finish after `count` messages
    pub fn with_limit(mut self, count: u64) -> Self {
        self.limit = Some(count);
        self
    }
}

impl Block for MessageStrobe {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new().message_input("set_msg").message_output("strobe")
    }

    fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        Ok(WorkReturn::Done)
    }

    fn handle_message(&mut self, port: &str, msg: TagValue, _outbox: &mut MessageOutbox) -> WorkResult {
        if port != "set_msg" {
            return Err(WorkError::NodeError(format!("no input port '{}'", port)));
        }
        debug!("[{}] Payload set to {}", self.name, msg);
        self.msg = msg;
        Ok(())
    }

    fn tick(&mut self, outbox: &mut MessageOutbox) -> WorkResult {
        if self.finished() {
            return Ok(());
        }
        let now = Instant::now();
        let due = self.next_fire.is_none_or(|at| now >= at);
        if due {
            outbox.post("strobe", self.msg.clone());
            self.sent += 1;
            self.next_fire = Some(now + self.period);
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.limit.is_some_and(|limit| self.sent >= limit)
    }
}

/// Logs messages arriving on `print` and keeps those arriving on `store`
pub struct MessageDebug {
    name: String,
    stored: Arc<Mutex<Vec<TagValue>>>,
    expected: Option<usize>,
}

impl MessageDebug {
    pub fn new() -> Self {
        Self {
            name: "message_debug".to_string(),
            stored: Arc::new(Mutex::new(Vec::new())),
            expected: None,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Finish once `count` messages have been stored
    pub fn with_expected(mut self, count: usize) -> Self {
        self.expected = Some(count);
        self
    }

    /// Shared handle on the stored messages
    pub fn messages(&self) -> Arc<Mutex<Vec<TagValue>>> {
        Arc::clone(&self.stored)
    }

    fn stored_len(&self) -> usize {
        self.stored.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MessageDebug {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for MessageDebug {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new().message_input("print").message_input("store")
    }

    fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        Ok(WorkReturn::Done)
    }

    fn handle_message(&mut self, port: &str, msg: TagValue, _outbox: &mut MessageOutbox) -> WorkResult {
        match port {
            "print" => {
                info!("[{}] {}", self.name, msg);
                Ok(())
            }
            "store" => {
                self.stored.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
                Ok(())
            }
            other => Err(WorkError::NodeError(format!("no input port '{}'", other))),
        }
    }

    fn finished(&self) -> bool {
        self.expected.is_some_and(|n| self.stored_len() >= n)
    }
}
