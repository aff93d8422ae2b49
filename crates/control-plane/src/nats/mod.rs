//! NATS wake-up channels.

mod publisher;

pub use publisher::Notifier;
