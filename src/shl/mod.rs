pub mod api;
pub mod client;
pub mod token;

pub use api::ShlClient;
pub use client::{HttpTransport, RateLimitedClient};
