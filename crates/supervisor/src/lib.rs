pub mod args;
pub mod config;
pub mod env_path;
pub mod error;
pub mod estimate;
pub mod job;
pub mod monitor;
pub mod options;
pub mod process_tree;
pub mod progress;
pub mod registry;
pub mod status;
pub mod watch;

pub use args::BuiltArgs;
pub use config::SupervisorConfig;
pub use env_path::{DependencyPath, DependencyPaths, DependencySource};
pub use error::{SideFileError, SupervisorError};
pub use job::{Job, JobEvent};
pub use options::{EncodeOptions, Encoder, EncoderParams, Field};
pub use registry::JobRegistry;
pub use status::{ProgressSnapshot, StateTag, StatusEvent};
