//! CLI command implementations

pub mod error;
pub mod presets;
pub mod transfer;

pub use error::CliError;
pub use presets::PresetsCommand;
pub use transfer::{Cli, Commands, OutputFormat, PushArgs, StreamArgs};
