#![allow(dead_code)]

use nostr::prelude::*;
use nostr_subscriptions::{
    ChannelRelay, ClientMessage, EngineSettings, ManualTimer, SharedRelay, SubscriptionManager,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn kind(kind: u16) -> Kind {
    Kind::from(kind)
}

pub fn create_test_event(keys: &Keys, kind: u16, content: &str) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .sign_with_keys(keys)
        .expect("Failed to sign event")
}

pub fn test_relay(url: &str) -> (SharedRelay, mpsc::UnboundedReceiver<ClientMessage>) {
    let url = RelayUrl::parse(url).expect("Invalid test relay URL");
    let (relay, receiver) = ChannelRelay::new(url);
    (Arc::new(relay), receiver)
}

pub fn drain(receiver: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn setup_manager() -> (SubscriptionManager, Arc<ManualTimer>) {
    let timer = Arc::new(ManualTimer::new());
    let manager = SubscriptionManager::builder(EngineSettings::default())
        .with_timer(timer.clone())
        .build();
    (manager, timer)
}
