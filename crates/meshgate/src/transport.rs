//! # Actor Transport
//!
//! The seam between the gateway and an actor: send one [`Message`], await the
//! reply bytes. The transport does not interpret payloads and applies no
//! deadline of its own; callers bound every send.
//!
//! [`ChannelTransport`] is the in-process implementation. The actor side
//! drains an [`ActorInbox`] and answers each [`ActorCall`] through its reply
//! slot. Dropping or closing the inbox fails every pending and future send
//! with [`Error::ChannelClosed`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use meshwire::Message;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("actor did not answer within {0:?}")]
    Timeout(Duration),
    #[error("actor channel closed")]
    ChannelClosed,
    /// The actor answered with an error instead of a reply.
    #[error("actor error: {0}")]
    Actor(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sends a message to one actor and waits for its reply.
///
/// Object-safe; links hold it as `Arc<dyn ActorTransport>`.
#[async_trait::async_trait]
pub trait ActorTransport: Send + Sync + 'static {
    async fn send(&self, message: Message) -> Result<Vec<u8>>;
}

/// A message waiting for the actor, with the slot its reply goes into.
pub struct ActorCall {
    pub message: Message,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

impl ActorCall {
    /// Answers the call. A caller that already gave up is ignored.
    pub fn respond(self, reply: Result<Vec<u8>>) {
        let _ = self.reply.send(reply);
    }
}

/// Gateway side of an in-process actor channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ActorCall>,
}

/// Actor side of an in-process actor channel.
pub struct ActorInbox {
    rx: mpsc::Receiver<ActorCall>,
}

impl ActorInbox {
    pub async fn recv(&mut self) -> Option<ActorCall> {
        self.rx.recv().await
    }

    /// Stops accepting calls. Calls already queued can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Creates a bounded channel between the gateway and one actor.
pub fn channel(capacity: usize) -> (ChannelTransport, ActorInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelTransport { tx }, ActorInbox { rx })
}

#[async_trait::async_trait]
impl ActorTransport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorCall { message, reply })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }
}

/// A transport answered synchronously by a closure.
pub struct FnTransport<F>
where
    F: Fn(Message) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnTransport<F>
where
    F: Fn(Message) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F> ActorTransport for FnTransport<F>
where
    F: Fn(Message) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    async fn send(&self, message: Message) -> Result<Vec<u8>> {
        (self.handler)(message)
    }
}
