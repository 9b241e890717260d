//! Command-line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "grove",
    version,
    about = "Declarative multi-repository workspace management"
)]
pub struct Cli {
    /// Workspace root (overrides $GROVE_ROOT).
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Trace every command grove runs.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bring the workspace into conformance with its manifest.
    Update {
        /// Delete clean projects that left the manifest.
        #[arg(long)]
        gc: bool,
        /// Walk the whole tree instead of trusting the last snapshot.
        #[arg(long)]
        full_scan: bool,
    },
    /// Report per-project branch state.
    Status {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
        /// Also check for uncommitted and untracked files.
        #[arg(long)]
        dirty: bool,
    },
    /// Write the current workspace state to FILE as a manifest.
    Snapshot { file: PathBuf },
    /// Add a remote import to the root manifest.
    Import {
        /// Name of the import repository.
        name: String,
        /// Remote URL of the import repository.
        remote: String,
        /// Manifest file within the import repository.
        #[arg(long, default_value = "manifest")]
        manifest: String,
        /// Path prefix for the imported projects.
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn update_flags_parse() {
        let cli = Cli::parse_from(["grove", "update", "--gc", "--full-scan"]);
        match cli.command {
            Commands::Update { gc, full_scan } => {
                assert!(gc);
                assert!(full_scan);
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn global_root_flag_is_accepted_after_subcommand() {
        let cli = Cli::parse_from(["grove", "status", "--root", "/ws"]);
        assert_eq!(cli.root.as_deref(), Some(std::path::Path::new("/ws")));
    }
}
