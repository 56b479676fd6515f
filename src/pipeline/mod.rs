//! The generation pipeline: stage execution with retries, per-item state,
//! per-flow scheduling and the flow lifecycle.

pub mod flow;
pub mod item;
pub mod registry;
pub mod retry;
pub(crate) mod scheduler;
pub mod stage;

pub use flow::FlowController;
pub use registry::FlowRegistry;
pub use retry::RetryPolicy;
pub use stage::{StageExecutor, StageKind, StageRunner};
