//! Command-line interface definitions for the `tidewater` binary.
//!
//! The parser structures live here so both the main binary and the build
//! script can use them; the build script renders the manual page from them.

use clap::Parser;

/// Top-level CLI for the `tidewater` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tidewater",
    about = "Run a CI suite on ephemeral hosts, containers or clusters",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision, prepare, build, test, publish and tear down one suite.
    #[command(name = "run", about = "Run one suite against a commit")]
    Run(RunCommand),
}

/// Arguments for the `tidewater run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Suite definition file (JSON).
    #[arg(long, value_name = "PATH")]
    pub(crate) suite: String,
    /// Commit under test; statuses are reported against it.
    #[arg(long, value_name = "SHA")]
    pub(crate) commit: String,
    /// Local checkout synced to the execution target before preparation.
    #[arg(long, value_name = "DIR")]
    pub(crate) source: Option<String>,
    /// Branch being tested; suites may restrict the branches they run on.
    #[arg(long, value_name = "BRANCH", conflicts_with = "pull_id")]
    pub(crate) branch: Option<String>,
    /// Pull request number, when testing a pull request.
    #[arg(long, value_name = "NUMBER")]
    pub(crate) pull_id: Option<u64>,
    /// Marks the commit as a verified merge of its target branch.
    #[arg(long)]
    pub(crate) merge_verified: bool,
    /// Override the run identifier (defaults to a random UUID).
    #[arg(long, value_name = "ID")]
    pub(crate) run_id: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    pub(crate) log_json: bool,
}
