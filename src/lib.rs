//! Voice Dispatch: task scheduling and resilient provider dispatch for a
//! voice-assistant backend.

pub mod config;
pub mod error;
pub mod pool;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod resilience;
pub mod scheduler;
pub mod task;

mod sync;

pub use error::{Error, Result};
pub use scheduler::TaskManager;
pub use task::{Task, TaskRegistry};
