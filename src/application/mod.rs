//! Application層: ユースケースの実装
//!
//! Domain層のポートを組み合わせてパイプラインを動かす。
//! Infrastructure層の具象型には依存しない。

pub mod runner;
pub mod scheduler;
pub mod stats;

pub use runner::PipelineRunner;
pub use scheduler::{FrameScheduler, TaskOutcome};
pub use stats::{FrameStats, SmoothedValue};
