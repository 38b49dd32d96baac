//! Component G: the reconnecting SSE subscriber that feeds the refresher.

pub mod subscriber;

pub use subscriber::StreamSubscriber;
