//! NATS wake-up subscription.

mod subscriber;

pub use subscriber::JobWakeSubscriber;
