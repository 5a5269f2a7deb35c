//! Data models for Pulsewatch

pub mod alert;
pub mod message;
pub mod monitor;

pub use alert::*;
pub use message::*;
pub use monitor::*;
