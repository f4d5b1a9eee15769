//! Stream shaping blocks

use std::ops::{Add, Mul, Sub};

use bytemuck::Pod;
use tracing::{debug, info};

use crate::runtime::block::{
    Block, BlockMeta, PortSpec, Rate, WorkError, WorkIo, WorkResult, WorkReturn,
};
use crate::runtime::messages::MessageOutbox;
use crate::runtime::tag::TagValue;

/// Passes items through unchanged
///
/// A `false` on message port `en` disables it: input is then consumed and
/// dropped. `true` enables it again.
pub struct StreamCopy {
    name: String,
    item_size: usize,
    enabled: bool,
}

impl StreamCopy {
    pub fn new(item_size: usize) -> Self {
        Self {
            name: "copy".to_string(),
            item_size,
            enabled: true,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Block for StreamCopy {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new()
            .input(PortSpec::bytes(self.item_size))
            .output(PortSpec::bytes(self.item_size))
            .message_input("en")
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let n = io.noutput_items().min(io.ninput_items(0));
        if !self.enabled {
            io.consume(0, n);
            return Ok(WorkReturn::Produced(0));
        }
        let bytes = n * self.item_size;
        let input = io.inputs.bytes(0)?;
        let src = &input[..bytes];
        io.outputs.get_mut::<u8>(0)?[..bytes].copy_from_slice(src);
        Ok(WorkReturn::Produced(n))
    }

    fn handle_message(&mut self, port: &str, msg: TagValue, _outbox: &mut MessageOutbox) -> WorkResult {
        match (port, msg) {
            ("en", TagValue::Bool(on)) => {
                debug!("[{}] {}", self.name, if on { "enabled" } else { "disabled" });
                self.enabled = on;
                Ok(())
            }
            (port, msg) => Err(WorkError::NodeError(format!(
                "unexpected message {} on port '{}'",
                msg, port
            ))),
        }
    }
}

/// Passes the first `limit` items, then finishes
pub struct Head {
    name: String,
    item_size: usize,
    remaining: u64,
}

impl Head {
    pub fn new(item_size: usize, limit: u64) -> Self {
        Self {
            name: "head".to_string(),
            item_size,
            remaining: limit,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Block for Head {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new()
            .input(PortSpec::bytes(self.item_size))
            .output(PortSpec::bytes(self.item_size))
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        if self.remaining == 0 {
            return Ok(WorkReturn::Done);
        }
        let n = (io.noutput_items().min(io.ninput_items(0)) as u64).min(self.remaining) as usize;
        let bytes = n * self.item_size;
        let input = io.inputs.bytes(0)?;
        let src = &input[..bytes];
        io.outputs.get_mut::<u8>(0)?[..bytes].copy_from_slice(src);
        self.remaining -= n as u64;
        Ok(WorkReturn::Produced(n))
    }
}

/// Keeps the first item of every group of `n`
pub struct KeepOneInN {
    name: String,
    item_size: usize,
    n: usize,
}

impl KeepOneInN {
    pub fn new(item_size: usize, n: usize) -> Self {
        Self {
            name: "keep_one_in_n".to_string(),
            item_size,
            n: n.max(1),
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Block for KeepOneInN {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new()
            .input(PortSpec::bytes(self.item_size))
            .output(PortSpec::bytes(self.item_size))
            .with_rate(Rate::decimator(self.n as u64))
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let isz = self.item_size;
        let n = io.noutput_items().min(io.ninput_items(0) / self.n);
        let input = io.inputs.bytes(0)?;
        let out = io.outputs.get_mut::<u8>(0)?;
        for (i, chunk) in out[..n * isz].chunks_exact_mut(isz).enumerate() {
            let at = i * self.n * isz;
            chunk.copy_from_slice(&input[at..at + isz]);
        }
        Ok(WorkReturn::Produced(n))
    }
}

/// Repeats every input item `interp` times
pub struct Repeat {
    name: String,
    item_size: usize,
    interp: usize,
}

impl Repeat {
    pub fn new(item_size: usize, interp: usize) -> Self {
        Self {
            name: "repeat".to_string(),
            item_size,
            interp: interp.max(1),
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Block for Repeat {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new()
            .input(PortSpec::bytes(self.item_size))
            .output(PortSpec::bytes(self.item_size))
            .with_rate(Rate::interpolator(self.interp as u64))
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let isz = self.item_size;
        let nin = (io.noutput_items() / self.interp).min(io.ninput_items(0));
        let input = io.inputs.bytes(0)?;
        let out = io.outputs.get_mut::<u8>(0)?;
        for (i, item) in input[..nin * isz].chunks_exact(isz).enumerate() {
            let base = i * self.interp * isz;
            for chunk in out[base..base + self.interp * isz].chunks_exact_mut(isz) {
                chunk.copy_from_slice(item);
            }
        }
        Ok(WorkReturn::Produced(nin * self.interp))
    }
}

/// Sum of the last `length` inputs, times a scale factor
///
/// Uses the input history, so the first outputs see zeros before the stream.
pub struct MovingSum<T> {
    name: String,
    length: usize,
    scale: T,
}

impl<T> MovingSum<T>
where
    T: Pod + Send + Default + Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
{
    pub fn new(length: usize, scale: T) -> Self {
        Self {
            name: "moving_sum".to_string(),
            length: length.max(1),
            scale,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<T> Block for MovingSum<T>
where
    T: Pod + Send + Default + Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new()
            .input(PortSpec::of::<T>())
            .output(PortSpec::of::<T>())
            .with_history(self.length)
    }

    fn start(&mut self) -> WorkResult {
        info!("[{}] Summing over {} items", self.name, self.length);
        Ok(())
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let n = io.noutput_items().min(io.ninput_items(0));
        if n == 0 {
            return Ok(WorkReturn::Produced(0));
        }
        let len = self.length;
        // window[0..len-1] is history, window[len-1..] is new input
        let window = io.inputs.get::<T>(0)?;
        let out = io.outputs.get_mut::<T>(0)?;

        let mut sum = window[..len].iter().fold(T::default(), |acc, &x| acc + x);
        for i in 0..n {
            if i > 0 {
                sum = sum + window[i + len - 1] - window[i - 1];
            }
            out[i] = sum * self.scale;
        }
        Ok(WorkReturn::Produced(n))
    }
}
