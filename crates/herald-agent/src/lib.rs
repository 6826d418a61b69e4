//! Job lifecycle core: a registry of running worker processes keyed by job
//! id, and a launcher that stages secrets, spawns workers and cleans up after
//! them.

pub mod error;
pub mod launcher;
pub mod log_sink;
pub mod process;
pub mod registry;
pub mod scope;
pub mod settings;
pub mod staging;
pub mod sweeper;
pub mod templates;

pub use error::JobError;
pub use launcher::{JobLauncher, LaunchRequest};
pub use registry::{ExitHook, JobExit, JobRegistry};
pub use settings::AgentSettings;
pub use sweeper::StaleSweeper;
pub use templates::TemplateSet;
