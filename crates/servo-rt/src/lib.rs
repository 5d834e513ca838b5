#![doc = "Real-time core of the servo kernel: periodic task engine, emergency interlock, and bank orchestration."]

pub mod faultlog;
pub mod interlock;
pub mod orchestrator;
pub mod rt;
pub mod task;

pub use faultlog::*;
pub use interlock::*;
pub use orchestrator::*;
pub use rt::*;
pub use task::*;
