//! MQTT sensor exporter library.
//!
//! Collects sensor values announced through the Homie convention and Home
//! Assistant MQTT discovery into one device registry and exposes the latest
//! value of each as a Prometheus gauge.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exporter;
pub mod hass;
pub mod homie;
pub mod input;
pub mod metrics;
pub mod registry;
pub mod server;
