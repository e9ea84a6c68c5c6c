mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use releasekit_core::ReleaseKitError;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ReleaseKitError::NothingToRelease) => {
            // `should-release` exists to answer exactly this question.
            let advisory = cli.if_needed || matches!(cli.command, Commands::ShouldRelease);
            if advisory {
                if !cli.quiet {
                    println!("No releasable changes.");
                }
                ExitCode::from(10)
            } else {
                if !cli.quiet {
                    println!("No releasable changes.");
                }
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> releasekit_core::Result<()> {
    // Commands that do not need a discovered workspace.
    match &cli.command {
        Commands::Init => return commands::cmd_init(),
        Commands::Migrate => return commands::cmd_migrate(),
        _ => {}
    }

    let ctx = commands::load_context()?;

    match &cli.command {
        Commands::Init | Commands::Migrate => unreachable!("handled above"),
        Commands::Discover => commands::cmd_discover(&ctx),
        Commands::Graph => commands::cmd_graph(&ctx),
        Commands::Check => commands::cmd_check(cli, &ctx),
        Commands::Plan(args) => commands::cmd_plan(cli, &ctx, args),
        Commands::Version(args) => commands::cmd_version(cli, &ctx, args),
        Commands::Prepare(args) => commands::cmd_prepare(cli, &ctx, args),
        Commands::Release => commands::cmd_release(cli, &ctx),
        Commands::Publish(args) => commands::cmd_publish(cli, &ctx, args),
        Commands::Rollback => commands::cmd_rollback(&ctx),
        Commands::Promote(args) => commands::cmd_promote(cli, &ctx, args),
        Commands::Snapshot(args) => commands::cmd_snapshot(cli, &ctx, args),
        Commands::ShouldRelease => commands::cmd_should_release(cli, &ctx),
    }
}
