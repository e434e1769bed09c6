//! Boundary to the relay transport.
//!
//! The engine never opens sockets. It talks to relays through [`RelayHandle`],
//! whose calls only enqueue a request: acknowledgements and events come back
//! later through [`crate::SubscriptionManager::handle_relay_message`].

use crate::error::Error;
use crate::filter::Filter;
use crate::message::ClientMessage;
use nostr::{Event, RelayUrl, SubscriptionId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub trait RelayHandle: Send + Sync + fmt::Debug {
    /// Stable identity of the relay, used as a map key throughout the engine.
    fn url(&self) -> &RelayUrl;

    fn subscribe(&self, subscription_id: &SubscriptionId, filters: &[Filter]) -> Result<(), Error>;

    fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<(), Error>;

    fn publish(&self, event: &Event) -> Result<(), Error>;
}

pub type SharedRelay = Arc<dyn RelayHandle>;

/// Relay handle that forwards wire messages to a transport task over a channel.
#[derive(Debug, Clone)]
pub struct ChannelRelay {
    url: RelayUrl,
    sender: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelRelay {
    pub fn new(url: RelayUrl) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { url, sender }, receiver)
    }

    fn send(&self, message: ClientMessage) -> Result<(), Error> {
        self.sender
            .send(message)
            .map_err(|e| Error::relay(format!("[{}] transport closed: {}", self.url, e)))
    }
}

impl RelayHandle for ChannelRelay {
    fn url(&self) -> &RelayUrl {
        &self.url
    }

    fn subscribe(&self, subscription_id: &SubscriptionId, filters: &[Filter]) -> Result<(), Error> {
        debug!(
            "[{}] REQ {} with {} filter(s)",
            self.url,
            subscription_id,
            filters.len()
        );
        self.send(ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters: filters.to_vec(),
        })
    }

    fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<(), Error> {
        debug!("[{}] CLOSE {}", self.url, subscription_id);
        self.send(ClientMessage::Close(subscription_id.clone()))
    }

    fn publish(&self, event: &Event) -> Result<(), Error> {
        debug!("[{}] EVENT {} kind {}", self.url, event.id, event.kind);
        self.send(ClientMessage::Event(Box::new(event.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_event, drain, kind, relay_url};
    use nostr::Keys;

    #[test]
    fn test_channel_relay_forwards_wire_messages() {
        let (relay, mut receiver) = ChannelRelay::new(relay_url("wss://relay.one"));
        let subscription_id = SubscriptionId::new("sub-1");
        let filters = vec![Filter::new().kind(kind(1))];
        let event = create_test_event(&Keys::generate(), 1, vec![], "hi");

        relay.subscribe(&subscription_id, &filters).unwrap();
        relay.publish(&event).unwrap();
        relay.unsubscribe(&subscription_id).unwrap();

        let messages = drain(&mut receiver);
        assert_eq!(
            messages,
            vec![
                ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filters,
                },
                ClientMessage::Event(Box::new(event)),
                ClientMessage::Close(subscription_id),
            ]
        );
    }

    #[test]
    fn test_channel_relay_reports_closed_transport() {
        let (relay, receiver) = ChannelRelay::new(relay_url("wss://relay.one"));
        drop(receiver);

        let result = relay.unsubscribe(&SubscriptionId::new("sub-1"));
        assert!(matches!(result, Err(Error::Relay { .. })));
    }
}
