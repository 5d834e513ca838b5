#![doc = "Common types shared across the servo kernel workspace."]

pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use telemetry::*;
