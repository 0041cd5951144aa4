pub mod autosave;
pub mod broadcast;
pub mod bundle;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod machine;
pub mod model;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod scope;
pub mod transfer;

pub use error::{OrchestratorError, Result};
pub use machine::{Meeting, Services};
pub use registry::MeetingRegistry;
