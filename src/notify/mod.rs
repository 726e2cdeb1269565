pub mod dispatcher;
pub mod push;
pub mod subscribers;

pub use dispatcher::EventDispatcher;
pub use push::{HttpPushGateway, LogPush, PushTransport};
pub use subscribers::SubscriberRegistry;
