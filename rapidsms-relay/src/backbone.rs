use crate::correlator::PendingReply;
use crate::errors::BackboneError;
use crate::message::Message;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// The only tag the relay sends to.
pub const DEFAULT_TAG: &str = "default";

/// The messaging backbone, as seen by the relay.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Sends a fresh message using the outbound routing named by `tag`.
    async fn send_to(&self, tag: &str, to_addr: &str, content: &str)
    -> Result<Message, BackboneError>;

    /// Sends `content` as a reply to a previously received message.
    async fn reply_to(&self, original: &PendingReply, content: &str)
    -> Result<Message, BackboneError>;
}

/// Outbound routing for one send_to tag.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SendToConfig {
    pub transport_name: Option<String>,
    #[serde(default)]
    pub from_addr: String,
}

/// Backbone that publishes outbound messages on a channel. The receiving side
/// owns delivery to the actual transport.
#[derive(Clone)]
pub struct ChannelBackbone {
    tx: mpsc::Sender<Message>,
    send_to: HashMap<String, SendToConfig>,
}

impl ChannelBackbone {
    pub fn new(tx: mpsc::Sender<Message>, send_to: HashMap<String, SendToConfig>) -> Self {
        Self { tx, send_to }
    }

    async fn publish(&self, message: Message) -> Result<Message, BackboneError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| BackboneError::Closed)?;
        Ok(message)
    }
}

#[async_trait]
impl Backbone for ChannelBackbone {
    async fn send_to(
        &self,
        tag: &str,
        to_addr: &str,
        content: &str,
    ) -> Result<Message, BackboneError> {
        let route = self
            .send_to
            .get(tag)
            .ok_or_else(|| BackboneError::UnknownTag(tag.to_string()))?;

        let message = Message::new(to_addr, &route.from_addr, content)
            .with_transport_name(route.transport_name.clone());
        self.publish(message).await
    }

    async fn reply_to(
        &self,
        original: &PendingReply,
        content: &str,
    ) -> Result<Message, BackboneError> {
        self.publish(original.reply(content)).await
    }
}
