//! Home Assistant MQTT discovery support.
//!
//! Entities are announced as JSON on `homeassistant/sensor/.../config`; their
//! values are published on the state topic named in that announcement, which
//! we subscribe to the first time the entity is seen.

mod data;
mod discovery;

pub use data::{HaDataHandler, PropertyBinding, StateOutcome};
pub use discovery::{
    DeviceDescriptor, DeviceIds, DiscoveryOutcome, EntityConfig, HaDiscoveryParser,
    SUBSCRIBE_TIMEOUT, status_topic_path,
};

#[cfg(test)]
pub(crate) mod testing {
    use crate::error::{ExporterError, Result};
    use crate::input::mqtt::Subscriber;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SubscribeBehaviour {
        Ack,
        Reject,
        Hang,
    }

    /// Subscriber that records requested topics.
    pub struct FakeSubscriber {
        behaviour: SubscribeBehaviour,
        delay: Duration,
        topics: Mutex<Vec<String>>,
    }

    impl FakeSubscriber {
        pub fn new(behaviour: SubscribeBehaviour) -> Self {
            Self {
                behaviour,
                delay: Duration::ZERO,
                topics: Mutex::new(Vec::new()),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn topics(&self) -> Vec<String> {
            self.topics.lock().clone()
        }
    }

    #[async_trait]
    impl Subscriber for FakeSubscriber {
        async fn subscribe(&self, topic: &str) -> Result<()> {
            self.topics.lock().push(topic.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.behaviour {
                SubscribeBehaviour::Ack => Ok(()),
                SubscribeBehaviour::Reject => Err(ExporterError::SubscribeRejected {
                    topic: topic.to_string(),
                }),
                SubscribeBehaviour::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }
}
