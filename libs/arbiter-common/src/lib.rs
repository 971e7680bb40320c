pub mod backend;
pub mod config;
pub mod protocol;
pub mod redis;
pub mod store;
pub mod types;

// Re-export commonly used types for convenience
pub use backend::{AoiClient, GradingBackend};
pub use config::{Config, ConfigError, LogFormat, SlotDeniedPolicy};
pub use protocol::{decode_line, Action, Message, Payload};
pub use store::{slot_usage, CoordinationStore, SlotUsage};
pub use types::{
    Heartbeat, RunnerCredentials, RunnerRegistration, SolutionDetails, SolutionInfo, SolutionPoll,
    SolutionRef,
};
