/// Stage deadlines.
pub mod deadline;
/// Cooperative shutdown signalling.
pub mod shutdown;
/// Stage workers and their polling loop.
pub mod worker;

pub use deadline::Deadline;
pub use shutdown::ShutdownToken;
pub use worker::{PollMode, StageHandler, Worker, WorkerConfig, WorkerReport};
