pub mod engine;
pub mod error;
pub mod fdlimit;
pub mod report;
pub mod request;
pub mod target;
pub mod textgen;

pub use engine::connection::{ConnState, Connection, RecvOutcome, SendKind, SendProgress};
pub use engine::scheduler::{evaluate_exit, ExitStatus, PoolCensus, RunSummary, TestRunner};
pub use error::SetupError;
