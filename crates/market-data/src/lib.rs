//! Live tick distribution: one publisher streams from the broker onto a
//! pub/sub channel, one subscriber persists that channel into the tick store.

pub mod bus;
pub mod gateway;
pub mod handlers;
mod keepalive;
pub mod publisher;
pub mod report;
pub mod subscriber;

pub use bus::{MemoryBus, RedisBus};
pub use gateway::ReplayGateway;
pub use handlers::{PublisherTaskHandler, SubscriberTaskHandler};
pub use publisher::TickPublisher;
pub use report::{PublisherReport, SubscriberReport, TaskExit};
pub use subscriber::{TickBuffer, TickSubscriber};
