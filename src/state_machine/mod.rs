mod job;
mod state;

pub use job::{Checkpoint, JobContext, JobOwner, RetryConfig};
pub use state::{BatchRoute, BatchStatus, StageOptions, StateMachine, TransactionStatus, Transition};
