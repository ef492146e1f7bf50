//! Input sources for the exporter.
//!
//! Current input sources:
//! - `mqtt`: broker connection delivering Homie and Home Assistant topics

pub mod mqtt;
