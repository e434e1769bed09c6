pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod filter;
pub mod grouping;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod relay;
pub mod sampler;
pub mod stream;
pub mod subscription;
pub mod timer;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used items
pub use cache::{EventCache, MemoryCache};
pub use config::{EngineSettings, ValidationSettings};
pub use error::Error;
pub use event::EventExt;
pub use filter::Filter;
pub use grouping::Grouper;
pub use manager::{DispatchOutcome, ManagerBuilder, RelayEvent, SubscriptionManager};
pub use message::{ClientMessage, RelayMessage};
pub use relay::{ChannelRelay, RelayHandle, SharedRelay};
pub use sampler::{ValidationSampler, ValidationStats};
pub use stream::{EventStream, OverflowPolicy, StreamReceiver};
pub use subscription::{FetchState, Subscription, SubscriptionOptions};
pub use timer::{ManualTimer, Timer, TokioTimer};
