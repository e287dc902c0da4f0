//! Control-aware mailbox feeding the queue worker
//!
//! Two unbounded FIFO channels, one per message class. Any number of
//! senders may push concurrently; the single receiver always takes a
//! pending control message before looking at the normal channel, so a
//! flood of data messages cannot starve a drain request.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

/// Scheduling class of a mailbox message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Served before any normal message
    Control,
    /// Served in arrival order once no control message is pending
    Normal,
}

/// Messages that know their own scheduling class
pub trait Classify {
    fn class(&self) -> MessageClass;
}

/// Create a connected sender/receiver pair
pub fn mailbox<M: Classify>() -> (MailboxSender<M>, Mailbox<M>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    (
        MailboxSender {
            control: control_tx,
            normal: normal_tx,
        },
        Mailbox {
            control: control_rx,
            normal: normal_rx,
        },
    )
}

/// Sending half; cheap to clone and safe to share between producers
pub struct MailboxSender<M> {
    control: mpsc::UnboundedSender<M>,
    normal: mpsc::UnboundedSender<M>,
}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            normal: self.normal.clone(),
        }
    }
}

impl<M: Classify> MailboxSender<M> {
    /// Route a message by class. Never blocks; fails only once the receiver is gone.
    pub fn send(&self, message: M) -> Result<(), SendError<M>> {
        match message.class() {
            MessageClass::Control => self.control.send(message),
            MessageClass::Normal => self.normal.send(message),
        }
    }

    /// Whether the receiving worker has gone away
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

/// Receiving half, owned by exactly one worker
pub struct Mailbox<M> {
    control: mpsc::UnboundedReceiver<M>,
    normal: mpsc::UnboundedReceiver<M>,
}

impl<M> Mailbox<M> {
    /// Next message, control first. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<M> {
        tokio::select! {
            biased;

            Some(message) = self.control.recv() => Some(message),
            Some(message) = self.normal.recv() => Some(message),
            else => None,
        }
    }

    /// Non-waiting variant of [`Mailbox::recv`]
    pub fn try_recv(&mut self) -> Option<M> {
        self.control
            .try_recv()
            .or_else(|_| self.normal.try_recv())
            .ok()
    }
}
