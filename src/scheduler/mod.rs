//! Task scheduling: admission, immediate dispatch and deferred execution.

mod dispatch;
mod manager;
mod scheduled;

pub use dispatch::TaskJob;
pub use manager::TaskManager;
pub use scheduled::ScheduledTasks;
