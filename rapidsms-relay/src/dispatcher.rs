//! Turns outbound requests from the remote system into backbone sends.

use crate::backbone::{Backbone, DEFAULT_TAG};
use crate::correlator::{CorrelationError, ReplyCorrelator};
use crate::errors::BackboneError;
use crate::message::Message;
use crate::metrics_defs::DISPATCH_SENDS;
use serde::Deserialize;
use shared::counter;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Body of a send request.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OutboundRequest {
    pub content: String,
    pub to_addr: Vec<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl OutboundRequest {
    pub fn decode(body: &[u8]) -> Result<Self, DispatchError> {
        let request: OutboundRequest = serde_json::from_slice(body)?;
        if request.to_addr.is_empty() {
            return Err(DispatchError::EmptyRecipients);
        }
        Ok(request)
    }
}

/// The request as a whole could not be handled.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("invalid request body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("to_addr must contain at least one address")]
    EmptyRecipients,
}

/// A single recipient's send failed. Siblings are unaffected.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("Invalid to_addr for reply")]
    InvalidReplyAddress,
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Backbone(#[from] BackboneError),
}

#[derive(Clone)]
pub struct InboundDispatcher {
    backbone: Arc<dyn Backbone>,
    /// Present only when replies are enabled.
    correlator: Option<ReplyCorrelator>,
}

impl InboundDispatcher {
    pub fn new(backbone: Arc<dyn Backbone>, correlator: Option<ReplyCorrelator>) -> Self {
        Self {
            backbone,
            correlator,
        }
    }

    /// Sends the request and returns the messages that made it into the
    /// backbone, in the order their sends completed.
    ///
    /// Every recipient is sent on its own task and all of them are awaited.
    /// A failed recipient is logged and left out of the result; it never
    /// fails the request.
    pub async fn dispatch(&self, request: OutboundRequest) -> Result<Vec<Message>, DispatchError> {
        if request.to_addr.is_empty() {
            return Err(DispatchError::EmptyRecipients);
        }

        let mut join_set = JoinSet::new();
        let content = request.content;

        match (&self.correlator, request.in_reply_to) {
            (Some(correlator), Some(in_reply_to)) => {
                let backbone = self.backbone.clone();
                let correlator = correlator.clone();
                let to_addr = request.to_addr;
                join_set.spawn(async move {
                    let target = in_reply_to.clone();
                    let result = send_reply(&*backbone, &correlator, &in_reply_to, &to_addr, &content).await;
                    (target, result)
                });
            }
            _ => {
                for to_addr in request.to_addr {
                    let backbone = self.backbone.clone();
                    let content = content.clone();
                    join_set.spawn(async move {
                        let result = backbone
                            .send_to(DEFAULT_TAG, &to_addr, &content)
                            .await
                            .map_err(SendError::from);
                        (to_addr, result)
                    });
                }
            }
        }

        let mut sent = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(message))) => {
                    counter!(DISPATCH_SENDS, "outcome" => "ok").increment(1);
                    sent.push(message);
                }
                Ok((target, Err(e))) => {
                    counter!(DISPATCH_SENDS, "outcome" => "error").increment(1);
                    tracing::warn!(recipient = %target, error = %e, "send failed");
                }
                Err(e) => {
                    counter!(DISPATCH_SENDS, "outcome" => "error").increment(1);
                    tracing::error!("Send task panicked: {}", e);
                }
            }
        }

        Ok(sent)
    }
}

async fn send_reply(
    backbone: &dyn Backbone,
    correlator: &ReplyCorrelator,
    in_reply_to: &str,
    to_addrs: &[String],
    content: &str,
) -> Result<Message, SendError> {
    let original = correlator.recall(in_reply_to).await?;

    // A reply goes back to exactly the sender of the original
    let [to_addr] = to_addrs else {
        return Err(SendError::InvalidReplyAddress);
    };
    if *to_addr != original.from_addr {
        return Err(SendError::InvalidReplyAddress);
    }

    // Only the caller that takes the entry may send, so it is answered once
    let claimed = correlator.claim(in_reply_to).await?;

    match backbone.reply_to(&claimed.pending, content).await {
        Ok(reply) => Ok(reply),
        Err(e) => {
            if let Err(restore_err) = correlator.restore(&claimed).await {
                tracing::warn!(
                    in_reply_to = %in_reply_to,
                    error = %restore_err,
                    "could not restore pending reply"
                );
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::MemoryStore;
    use crate::testutils::MockBackbone;
    use std::time::Duration;

    fn request(to_addr: &[&str], in_reply_to: Option<&str>) -> OutboundRequest {
        OutboundRequest {
            content: "hello".into(),
            to_addr: to_addr.iter().map(|s| s.to_string()).collect(),
            in_reply_to: in_reply_to.map(String::from),
        }
    }

    fn correlator() -> ReplyCorrelator {
        ReplyCorrelator::new(Arc::new(MemoryStore::new()))
    }

    async fn remembered(correlator: &ReplyCorrelator, from_addr: &str) -> Message {
        let original = Message::new("1234", from_addr, "question");
        correlator
            .remember(&original, Duration::from_secs(60))
            .await
            .unwrap();
        original
    }

    #[test]
    fn test_decode() {
        let req = OutboundRequest::decode(br#"{"content": "hi", "to_addr": ["+2781"]}"#).unwrap();
        assert_eq!(req.content, "hi");
        assert_eq!(req.to_addr, vec!["+2781"]);
        assert_eq!(req.in_reply_to, None);

        let req =
            OutboundRequest::decode(br#"{"content": "hi", "to_addr": ["a"], "in_reply_to": "m1"}"#)
                .unwrap();
        assert_eq!(req.in_reply_to.as_deref(), Some("m1"));

        assert!(matches!(
            OutboundRequest::decode(b"not json"),
            Err(DispatchError::Decode(_))
        ));
        assert!(matches!(
            OutboundRequest::decode(br#"{"to_addr": ["a"]}"#),
            Err(DispatchError::Decode(_))
        ));
        assert!(matches!(
            OutboundRequest::decode(br#"{"content": "hi", "to_addr": []}"#),
            Err(DispatchError::EmptyRecipients)
        ));
    }

    #[tokio::test]
    async fn test_fan_out_one_send_per_recipient() {
        let backbone = Arc::new(MockBackbone::new());
        let dispatcher = InboundDispatcher::new(backbone.clone(), None);

        let sent = dispatcher.dispatch(request(&["A", "B", "C"], None)).await.unwrap();

        assert_eq!(sent.len(), 3);
        let mut addrs: Vec<_> = backbone.sent().into_iter().map(|m| m.to_addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_dropped() {
        let backbone = Arc::new(MockBackbone::new().failing_for("B"));
        let dispatcher = InboundDispatcher::new(backbone.clone(), None);

        let sent = dispatcher.dispatch(request(&["A", "B"], None)).await.unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_addr, "A");
        assert_eq!(sent[0].content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_results_in_completion_order() {
        let backbone = Arc::new(MockBackbone::new().delayed_for("A", Duration::from_millis(200)));
        let dispatcher = InboundDispatcher::new(backbone, None);

        let sent = dispatcher.dispatch(request(&["A", "B"], None)).await.unwrap();

        let addrs: Vec<_> = sent.iter().map(|m| m.to_addr.as_str()).collect();
        assert_eq!(addrs, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_reply() {
        let backbone = Arc::new(MockBackbone::new());
        let correlator = correlator();
        let original = remembered(&correlator, "+27831234567").await;
        let dispatcher = InboundDispatcher::new(backbone.clone(), Some(correlator.clone()));

        let sent = dispatcher
            .dispatch(request(&["+27831234567"], Some(&original.message_id)))
            .await
            .unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].in_reply_to.as_deref(),
            Some(original.message_id.as_str())
        );
        assert_eq!(sent[0].to_addr, "+27831234567");
        assert_eq!(sent[0].from_addr, "1234");
        // The pending reply is consumed
        assert!(correlator.recall(&original.message_id).await.is_err());
    }

    #[tokio::test]
    async fn test_reply_to_wrong_address_fails() {
        let backbone = Arc::new(MockBackbone::new());
        let correlator = correlator();
        let original = remembered(&correlator, "+27831234567").await;
        let dispatcher = InboundDispatcher::new(backbone.clone(), Some(correlator.clone()));

        let sent = dispatcher
            .dispatch(request(&["+27839999999"], Some(&original.message_id)))
            .await
            .unwrap();
        assert!(sent.is_empty());

        // More than one recipient is never a valid reply
        let sent = dispatcher
            .dispatch(request(
                &["+27831234567", "+27831234567"],
                Some(&original.message_id),
            ))
            .await
            .unwrap();
        assert!(sent.is_empty());
        assert!(backbone.sent().is_empty());

        // Entry is still there for a valid reply
        assert!(correlator.recall(&original.message_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_replies_send_once() {
        let backbone = Arc::new(MockBackbone::new().delayed_for("+27831234567", Duration::from_millis(50)));
        let correlator = correlator();
        let original = remembered(&correlator, "+27831234567").await;
        let dispatcher = InboundDispatcher::new(backbone.clone(), Some(correlator));

        let (first, second) = tokio::join!(
            dispatcher.dispatch(request(&["+27831234567"], Some(&original.message_id))),
            dispatcher.dispatch(request(&["+27831234567"], Some(&original.message_id)))
        );

        assert_eq!(first.unwrap().len() + second.unwrap().len(), 1);
        assert_eq!(backbone.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reply_can_be_retried() {
        let backbone = Arc::new(MockBackbone::new().failing_for("+27831234567"));
        let correlator = correlator();
        let original = remembered(&correlator, "+27831234567").await;
        let dispatcher = InboundDispatcher::new(backbone, Some(correlator.clone()));

        let sent = dispatcher
            .dispatch(request(&["+27831234567"], Some(&original.message_id)))
            .await
            .unwrap();
        assert!(sent.is_empty());

        // The backbone refused it, so the entry is back for another attempt
        assert!(correlator.recall(&original.message_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_reply_to_unknown_message_fails() {
        let backbone = Arc::new(MockBackbone::new());
        let dispatcher = InboundDispatcher::new(backbone.clone(), Some(correlator()));

        let sent = dispatcher
            .dispatch(request(&["+27831234567"], Some("unknown")))
            .await
            .unwrap();
        assert!(sent.is_empty());
        assert!(backbone.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reply_after_timeout_fails() {
        let backbone = Arc::new(MockBackbone::new());
        let correlator = correlator();
        let original = Message::new("1234", "+27831234567", "question");
        correlator
            .remember(&original, Duration::from_millis(50))
            .await
            .unwrap();
        let dispatcher = InboundDispatcher::new(backbone.clone(), Some(correlator));

        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = dispatcher
            .dispatch(request(&["+27831234567"], Some(&original.message_id)))
            .await
            .unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_in_reply_to_ignored_when_replies_disabled() {
        let backbone = Arc::new(MockBackbone::new());
        let dispatcher = InboundDispatcher::new(backbone.clone(), None);

        let sent = dispatcher
            .dispatch(request(&["A", "B"], Some("m1")))
            .await
            .unwrap();

        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.in_reply_to.is_none()));
    }
}
