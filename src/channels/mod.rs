//! Output channel abstraction and the local CLI transport.

pub mod cli;

pub use cli::{CliChannel, CliCommand};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::HandlerError;

/// A message a handler wants delivered to the chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target channel id (shared channel or a user's private channel).
    pub channel: String,
    pub text: String,
}

/// Handle to the outbound message queue carried by every task.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    tx: mpsc::Sender<OutgoingMessage>,
}

impl OutputHandle {
    pub fn new(tx: mpsc::Sender<OutgoingMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message for delivery.
    pub async fn send(
        &self,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), HandlerError> {
        let channel = channel.into();
        self.tx
            .send(OutgoingMessage {
                channel: channel.clone(),
                text: text.into(),
            })
            .await
            .map_err(|_| HandlerError::Output { channel })
    }

    /// Report a failure on a channel, formatted for the chat surface.
    pub async fn send_error(
        &self,
        channel: impl Into<String>,
        detail: impl std::fmt::Display,
    ) -> Result<(), HandlerError> {
        self.send(channel, format!(":warning: something went wrong: `{detail}`"))
            .await
    }
}

impl PartialEq for OutputHandle {
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Private channel id of `user_id`.
pub fn direct_channel(user_id: &str) -> String {
    format!("D{user_id}")
}

/// Create an output handle and the receiving end the transport drains.
pub fn output_channel(capacity: usize) -> (OutputHandle, mpsc::Receiver<OutgoingMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutputHandle::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (out, mut rx) = output_channel(4);
        out.send("C1", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "C1");
        assert_eq!(msg.text, "hello");
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_fails() {
        let (out, rx) = output_channel(1);
        drop(rx);
        let err = out.send("C1", "lost").await.unwrap_err();
        assert!(matches!(err, HandlerError::Output { channel } if channel == "C1"));
    }

    #[test]
    fn handles_compare_by_channel_identity() {
        let (a, _rx_a) = output_channel(1);
        let (b, _rx_b) = output_channel(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
