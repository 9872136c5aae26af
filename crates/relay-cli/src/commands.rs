//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration and build its trigger graph
    Validate {
        /// Path to configuration file
        #[arg(default_value = "relay.yaml")]
        config: PathBuf,
    },

    /// Print the schedulers and build targets of a configuration
    Graph {
        /// Path to configuration file
        #[arg(default_value = "relay.yaml")]
        config: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Print the JSON schema of the configuration file
    Schema,

    /// Run a manual scheduler once
    Force {
        /// Path to configuration file
        #[arg(default_value = "relay.yaml")]
        config: PathBuf,

        /// Project to build
        #[arg(short, long)]
        project: String,

        /// Fetch then build, or build the current tree only
        #[arg(short, long, value_enum, default_value_t = ForceWhat::Fetch)]
        what: ForceWhat,

        /// Why the build is forced
        #[arg(short, long)]
        reason: String,

        /// Wipe build directories first
        #[arg(long)]
        clean: bool,

        /// Package and publish snapshots
        #[arg(long)]
        package: bool,

        /// Log actions instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Poll repositories and run nightly timers until interrupted
    Serve {
        /// Path to configuration file
        #[arg(default_value = "relay.yaml")]
        config: PathBuf,

        /// Log actions instead of running them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForceWhat {
    Fetch,
    Build,
}
