//! Tasks, completion callbacks and the executor registry.

mod callback;
mod model;
mod registry;

pub use callback::{OneshotCallback, TaskCallback, TaskOutcome};
pub use model::{Task, TaskStatus};
pub use registry::{FnExecutor, TaskExecutor, TaskRegistry, executor_fn};
