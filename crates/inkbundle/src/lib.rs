pub mod aliases;
pub mod boundary;
pub mod compiler;
pub mod config;
pub mod entry;
pub mod error;
pub mod js;
mod linker;
pub mod orchestrator;
pub mod patch;
pub mod resolver;
