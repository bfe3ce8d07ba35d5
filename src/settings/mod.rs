//! Settings are read from `settings/dev.toml` or `settings/release.toml`
//! unless `--settings <path>` says otherwise.
//! See `bin/settings_demo.rs` for a binary exercising the loader.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
