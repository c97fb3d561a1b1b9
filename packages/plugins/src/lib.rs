// ABOUTME: Task plugins for the hatch worker
// ABOUTME: Plugin/TaskPlugin hooks, the concurrent PluginSet and the built-in plugins

pub mod artifacts;
pub mod cache;
pub mod env;
pub mod error;
pub mod plugin;
pub mod set;
pub mod success;
pub mod tasklog;

pub use artifacts::ArtifactsPlugin;
pub use cache::CachePlugin;
pub use env::EnvPlugin;
pub use error::{merge_errors, PluginError, Result};
pub use plugin::{Plugin, TaskPlugin, TaskPluginOptions};
pub use set::PluginSet;
pub use success::SuccessPlugin;
pub use tasklog::TaskLogPlugin;
