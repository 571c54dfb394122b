//! Layered settings for the binaries: a TOML file plus `PORTAL_*` overrides.
//! See `bin/settings_demo.rs` for a test binary demonstrating its usage.

mod cli;
pub use clap::{Parser, Subcommand};
pub use cli::*;

mod settings;
pub use settings::*;
