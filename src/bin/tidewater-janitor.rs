//! Leak sweeper for a single tidewater run.
//!
//! Deletes every Scaleway server and flexible IP tagged
//! `tidewater-run-<id>` and every container labelled `tidewater.run=<id>`,
//! then verifies nothing remains.

use std::io::Write as _;

use clap::Parser;
use tidewater::janitor::{DEFAULT_CONTAINER_BIN, DEFAULT_SCW_BIN, Janitor, JanitorConfig};
use tidewater::telemetry::init_tracing;
use tidewater::transport::ProcessCommandRunner;

#[derive(Debug, Parser)]
#[command(
    name = "tidewater-janitor",
    about = "Delete cloud and container resources left behind by one run"
)]
struct Cli {
    /// Scaleway project id used to scope discovery.
    #[arg(long, env = "SCW_DEFAULT_PROJECT_ID")]
    project_id: String,
    /// Run id whose resources are swept.
    #[arg(long, env = "TIDEWATER_RUN_ID")]
    run_id: String,
    /// Path to the Scaleway CLI binary.
    #[arg(long, default_value = DEFAULT_SCW_BIN)]
    scw_bin: String,
    /// Path to the container CLI binary.
    #[arg(long, default_value = DEFAULT_CONTAINER_BIN)]
    container_bin: String,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = JanitorConfig::new(cli.project_id, cli.run_id, cli.scw_bin, cli.container_bin)
        .map_err(|err| err.to_string())?;
    let janitor = Janitor::new(config, ProcessCommandRunner);
    let summary = janitor.sweep().await.map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "janitor sweep complete: deleted_servers={}, deleted_ips={}, deleted_containers={}",
        summary.deleted_servers,
        summary.deleted_ips,
        summary.deleted_containers
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
