use clap::{Args, Parser, Subcommand};

/// ReleaseKit CLI – plan, prepare, and publish releases across a polyglot monorepo
#[derive(Debug, Parser)]
#[command(name = "releasekit", version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,

    /// Simulate the command without modifying files or remote state
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Continue past failed pre-flight checks and steal fresh locks
    #[arg(long, global = true)]
    pub force: bool,

    /// Steal a fresh process lock left by another run
    #[arg(long, global = true)]
    pub force_lock: bool,

    /// Restrict to packages from these workspace labels
    #[arg(long, global = true, value_name = "LABEL")]
    pub workspace: Vec<String>,

    /// Restrict to packages in these groups (wildcards allowed)
    #[arg(long, global = true, value_name = "GROUP")]
    pub group: Vec<String>,

    /// Restrict to these packages (wildcards allowed)
    #[arg(short, long, global = true, value_name = "PACKAGE")]
    pub package: Vec<String>,

    /// Exclude these packages (wildcards allowed)
    #[arg(long, global = true, value_name = "PACKAGE")]
    pub exclude: Vec<String>,

    /// Worker pool size for publishing
    #[arg(long, global = true, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Retry budget for transient failures
    #[arg(long, global = true, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Exit with code 10 instead of 0 when there is nothing to release
    #[arg(long, global = true)]
    pub if_needed: bool,

    /// Verbose progress output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a starter releasekit.toml at the workspace root
    Init,

    /// List discovered packages and their internal dependencies
    Discover,

    /// Print the dependency graph with topological levels
    Graph,

    /// Run the pre-flight checks and report findings
    Check,

    /// Compute and print the release plan for the current window
    Plan(PlanArgs),

    /// Apply the planned version bumps and changelogs locally
    Version(PlanArgs),

    /// Rewrite manifests, commit, and open or update the Release PR
    Prepare(PlanArgs),

    /// Tag and create forge releases for a merged Release PR
    Release,

    /// Build and upload every planned package in dependency order
    Publish(PublishArgs),

    /// Restore pinned manifests and clear a crashed run's state
    Rollback,

    /// Strip pre-release suffixes to produce the stable versions
    Promote(PromoteArgs),

    /// Cut a pre-release at the given stability label
    Snapshot(SnapshotArgs),

    /// Exit 0 when there are releasable changes, 10 otherwise
    ShouldRelease,

    /// Move a legacy dot-file configuration to releasekit.toml
    Migrate,
}

#[derive(Debug, Args, Default)]
pub struct PlanArgs {
    /// Bump packages with no releasable commits as well (patch)
    #[arg(long)]
    pub force_unchanged: bool,
}

#[derive(Debug, Args, Default)]
pub struct PublishArgs {
    /// Where the publish runs: from a CI release event or a local checkout
    #[arg(long, value_name = "SOURCE", default_value = "ci")]
    pub publish_from: PublishFrom,

    /// Run configured hook commands after verification
    #[arg(long)]
    pub run_hooks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PublishFrom {
    #[default]
    Ci,
    Local,
}

#[derive(Debug, Args)]
pub struct PromoteArgs {
    /// Packages to promote (all pre-release packages when omitted)
    #[arg(value_name = "PACKAGE")]
    pub packages: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    /// Stability label for the snapshot (alpha, beta, rc)
    pub label: String,

    /// Packages to snapshot (all planned packages when omitted)
    #[arg(value_name = "PACKAGE")]
    pub packages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_with_filters() {
        let cli = Cli::try_parse_from([
            "releasekit",
            "plan",
            "--group",
            "plugins",
            "-p",
            "core",
            "--exclude",
            "examples-*",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Plan(_)));
        assert_eq!(cli.group, vec!["plugins"]);
        assert_eq!(cli.package, vec!["core"]);
        assert_eq!(cli.exclude, vec!["examples-*"]);
    }

    #[test]
    fn parses_publish_from_local() {
        let cli =
            Cli::try_parse_from(["releasekit", "publish", "--publish-from", "local"]).unwrap();
        match cli.command {
            Commands::Publish(args) => assert_eq!(args.publish_from, PublishFrom::Local),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn dry_run_is_global() {
        let cli = Cli::try_parse_from(["releasekit", "prepare", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Commands::Prepare(_)));
    }

    #[test]
    fn parses_snapshot_label_and_packages() {
        let cli = Cli::try_parse_from(["releasekit", "snapshot", "beta", "core"]).unwrap();
        match cli.command {
            Commands::Snapshot(args) => {
                assert_eq!(args.label, "beta");
                assert_eq!(args.packages, vec!["core"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["releasekit", "plan", "-q", "-v"]).is_err());
    }

    #[test]
    fn parses_concurrency_and_retries() {
        let cli = Cli::try_parse_from([
            "releasekit",
            "publish",
            "--concurrency",
            "8",
            "--max-retries",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.concurrency, Some(8));
        assert_eq!(cli.max_retries, Some(5));
    }

    #[test]
    fn parses_workspace_and_force() {
        let cli = Cli::try_parse_from([
            "releasekit",
            "publish",
            "--workspace",
            "rust",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.workspace, vec!["rust"]);
        assert!(cli.force);
    }

    #[test]
    fn parses_should_release() {
        let cli = Cli::try_parse_from(["releasekit", "should-release", "--if-needed"]).unwrap();
        assert!(cli.if_needed);
        assert!(matches!(cli.command, Commands::ShouldRelease));
    }
}
