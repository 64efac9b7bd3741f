use crate::Packet;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How locally published messages leave the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// One packet per message.
    Immediate,
    /// Buffer per channel and flush every window.
    Batched(Duration),
}

impl PublishMode {
    /// An absent or zero window publishes immediately.
    pub fn from_window(window: Option<Duration>) -> Self {
        match window {
            Some(window) if !window.is_zero() => Self::Batched(window),
            _ => Self::Immediate,
        }
    }
}

/// Per-channel message buffer for batched publishing.
///
/// A flush emits one packet per channel holding that channel's messages in
/// the order they were pushed. Channels come out in first-buffered order.
#[derive(Debug)]
pub struct OutboundBuffer {
    window: Duration,
    pending: HashMap<String, Vec<Value>>,
    order: Vec<String>,
    deadline: Option<Instant>,
}

impl OutboundBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            order: Vec::new(),
            deadline: None,
        }
    }

    /// Buffer `message`; arms the flush deadline on the first push.
    pub fn push(&mut self, channel: &str, message: Value) {
        match self.pending.get_mut(channel) {
            Some(messages) => messages.push(message),
            None => {
                self.order.push(channel.to_string());
                self.pending.insert(channel.to_string(), vec![message]);
            }
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Take everything buffered as `(channel, packet)` pairs.
    pub fn drain(&mut self, sender: &str) -> Vec<(String, Packet)> {
        self.deadline = None;
        let mut pending = std::mem::take(&mut self.pending);
        self.order
            .drain(..)
            .filter_map(|channel| {
                let messages = pending.remove(&channel)?;
                Some((channel, Packet::new(Some(sender.to_string()), messages)))
            })
            .collect()
    }
}
