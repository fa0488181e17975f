pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod suite;
pub mod utils;

pub use cli::config::{Config, RunOptions};
pub use engine::executor::{IterationScript, VuContext};
pub use engine::{Engine, RunState, RunSummary};
pub use error::ConfigError;
pub use utils::parse_duration_str;
