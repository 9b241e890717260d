use std::process;

use anyhow::Context;
use clap::Parser;

use grove::error::Error;
use grove::manifest::{self, Import};
use grove::report;
use grove::runner;
use grove::update::{self, UpdateOptions};
use grove::workspace::Workspace;

mod cli;

use cli::{Cli, Commands, OutputFormat};

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .format_timestamp_millis()
    .init();

    runner::forward_termination_signals();

    let result = run(&cli);
    if let Err(e) = result {
        eprintln!("grove: {e:#}");
        let code = e
            .downcast_ref::<Error>()
            .map(Error::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let ws = Workspace::discover(cli.root.as_deref()).context("locating workspace")?;

    match &cli.command {
        Commands::Update { gc, full_scan } => {
            let summary = update::update_workspace(
                &ws,
                UpdateOptions {
                    gc: *gc,
                    full_scan: *full_scan,
                },
            )?;
            for line in &summary.operations {
                log::info!("{line}");
            }
            for advisory in &summary.advisories {
                println!("NOTE: {advisory}");
            }
            Ok(())
        }
        Commands::Status { format, dirty } => {
            let states = report::project_states(&ws, *dirty)?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&states)?);
                }
                OutputFormat::Text => {
                    for state in &states {
                        print_state(&ws, state);
                    }
                }
            }
            Ok(())
        }
        Commands::Snapshot { file } => {
            let snapshot = update::snapshot_workspace(&ws)?;
            manifest::xml::write_manifest(file, &snapshot)?;
            println!("wrote {}", file.display());
            Ok(())
        }
        Commands::Import {
            name,
            remote,
            manifest: manifest_file,
            prefix,
        } => {
            let import = Import {
                name: name.clone(),
                remote: remote.clone(),
                manifest: manifest_file.clone(),
                root: prefix.clone(),
                ..Import::default()
            };
            manifest::add_remote_import(&ws.root_manifest(), import)?;
            println!("imported {name} into {}", ws.root_manifest().display());
            Ok(())
        }
    }
}

fn print_state(ws: &Workspace, state: &report::ProjectState) {
    let path = state
        .path
        .strip_prefix(ws.root())
        .unwrap_or(&state.path)
        .display();
    let mut flags = String::new();
    if state.has_uncommitted == Some(true) {
        flags.push_str(" [dirty]");
    }
    if state.has_untracked == Some(true) {
        flags.push_str(" [untracked]");
    }
    println!("{} ({path}) on {}{flags}", state.name, state.current_branch);
    for branch in &state.branches {
        let marker = if branch.name == state.current_branch {
            "*"
        } else {
            " "
        };
        let review = if branch.has_review_message {
            " (review message)"
        } else {
            ""
        };
        println!("  {marker} {}{review}", branch.name);
    }
}
