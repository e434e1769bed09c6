use crate::message::ClientMessage;
use crate::relay::{ChannelRelay, SharedRelay};
use nostr::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn kind(kind: u16) -> Kind {
    Kind::from(kind)
}

pub fn relay_url(url: &str) -> RelayUrl {
    RelayUrl::parse(url).expect("Invalid test relay URL")
}

pub fn create_test_event(keys: &Keys, kind: u16, tags: Vec<Tag>, content: &str) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .tags(tags)
        .sign_with_keys(keys)
        .expect("Failed to sign event")
}

pub fn create_test_event_at(keys: &Keys, kind: u16, created_at: u64) -> Event {
    EventBuilder::new(Kind::from(kind), "")
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .expect("Failed to sign event")
}

pub fn test_relay(url: &str) -> (SharedRelay, mpsc::UnboundedReceiver<ClientMessage>) {
    let (relay, receiver) = ChannelRelay::new(relay_url(url));
    (Arc::new(relay), receiver)
}

pub fn drain(receiver: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn req_ids(messages: &[ClientMessage]) -> Vec<SubscriptionId> {
    messages
        .iter()
        .filter_map(|message| match message {
            ClientMessage::Req {
                subscription_id, ..
            } => Some(subscription_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn close_ids(messages: &[ClientMessage]) -> Vec<SubscriptionId> {
    messages
        .iter()
        .filter_map(|message| match message {
            ClientMessage::Close(subscription_id) => Some(subscription_id.clone()),
            _ => None,
        })
        .collect()
}
