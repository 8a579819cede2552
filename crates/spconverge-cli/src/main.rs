use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use spconverge_stages::{HookEvent, StageId};

mod completion;
mod dispatch;
mod logging;
mod render;

use completion::CliCompletionShell;

const DEFAULT_SETTINGS_PATH: &str = "/etc/spconverge/settings.toml";

#[derive(Parser, Debug)]
#[command(name = "spconverge")]
#[command(about = "Staged StorPool client provisioning", long_about = None)]
struct Cli {
    /// Directory treated as the host's root filesystem.
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,
    /// Override a setting, as `key=value`. May be repeated.
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge a stage and everything it depends on.
    Converge {
        #[arg(value_parser = parse_stage)]
        stage: Option<StageId>,
    },
    /// Tear down a stage, its dependents, and everything it depends on.
    Teardown {
        #[arg(value_parser = parse_stage)]
        stage: Option<StageId>,
    },
    Status,
    /// Invalidate stages after an external change.
    Event { event: CliEvent },
    /// Allow a stopped or failed stage to converge again.
    Reset {
        #[arg(value_parser = parse_stage)]
        stage: StageId,
    },
    Txn {
        #[command(subcommand)]
        command: TxnCommands,
    },
    /// Add the storage network settings to an interfaces file.
    PatchInterfaces {
        /// Interfaces in `SP_IFACE` form, e.g. `eth0=9000,eth1.100`.
        #[arg(long)]
        spec: String,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "charm-storpool-config")]
        module: String,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum TxnCommands {
    ListModules,
    Show { module: String },
    Rollback { module: String },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliEvent {
    ConfigChanged,
    UpgradeCharm,
}

impl From<CliEvent> for HookEvent {
    fn from(value: CliEvent) -> Self {
        match value {
            CliEvent::ConfigChanged => HookEvent::ConfigChanged,
            CliEvent::UpgradeCharm => HookEvent::UpgradeCharm,
        }
    }
}

fn parse_stage(value: &str) -> std::result::Result<StageId, String> {
    value.parse::<StageId>().map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dispatch::run_cli(cli)
}

#[cfg(test)]
mod tests;
