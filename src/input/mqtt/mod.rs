//! MQTT input source.
//!
//! This module wraps the rumqttc client: it forwards incoming publishes to the
//! dispatcher and lets the Home Assistant parser subscribe to new state topics
//! at runtime, waiting for the broker's acknowledgement.

mod client;

use crate::error::Result;
use async_trait::async_trait;

pub use client::{MqttClient, MqttHandle, MqttMessage};

/// Transport side of a dynamic subscription.
///
/// `subscribe` resolves once the broker acknowledged the subscription, or
/// fails if it was rejected or the connection dropped first. Callers bound
/// the wait themselves.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
}
