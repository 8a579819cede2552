use anyhow::{Context, Result};
use std::io;
use std::path::Path;

use spconverge_core::{
    parse_overrides, FlagStore, HostLayout, LayeredSettings, SettingsLayer, KEY_STATUS,
};
use spconverge_netconf::{required_lines_from_spec, InterfacesPatcher};
use spconverge_stages::{Orchestrator, StageContext, StageGraph};
use spconverge_txn::TxnInstaller;
use tracing::{debug, info};

use crate::completion::write_completions_script;
use crate::logging::init_logging;
use crate::render::{
    format_event_lines, format_outcome_line, format_reset_lines, format_rollback_lines,
    format_status_lines, format_txn_entries,
};
use crate::{Cli, Commands, TxnCommands};

/// Settings file layer with the `--set` overrides on top.
pub(crate) fn load_settings(path: &Path, overrides: &[String]) -> Result<LayeredSettings> {
    let mut settings = if path.is_file() {
        LayeredSettings::load(path)?
    } else {
        LayeredSettings::new()
    };
    let overrides = parse_overrides(overrides)?;
    if !overrides.is_empty() {
        settings.push_front_layer(SettingsLayer {
            overrides,
            base: Default::default(),
        });
    }
    Ok(settings)
}

fn orchestrator(layout: HostLayout, settings: LayeredSettings) -> Result<Orchestrator> {
    let ctx = StageContext::system(layout, settings)?;
    Ok(Orchestrator::new(ctx))
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        return write_completions_script(*shell, &mut io::stdout().lock());
    }

    let settings = load_settings(&cli.settings, &cli.overrides)?;
    init_logging(&settings)?;
    if !cli.settings.is_file() {
        debug!(path = %cli.settings.display(), "no settings file, using defaults");
    }
    let layout = HostLayout::new(&cli.root);
    let graph = StageGraph::new();

    match cli.command {
        Commands::Converge { stage } => {
            let stage = stage.unwrap_or_else(|| graph.entry());
            let orchestrator = orchestrator(layout, settings)?;
            let outcome = orchestrator.converge(stage).map_err(|err| {
                anyhow::Error::new(err).context(format!("failed to converge the {stage} stage"))
            })?;
            println!("{}", format_outcome_line(stage, &outcome));
        }
        Commands::Teardown { stage } => {
            let stage = stage.unwrap_or_else(|| graph.entry());
            let orchestrator = orchestrator(layout, settings)?;
            orchestrator.teardown(stage).map_err(|err| {
                anyhow::Error::new(err).context(format!("failed to tear down the {stage} stage"))
            })?;
            println!("{stage}: stopped");
        }
        Commands::Status => {
            let orchestrator = orchestrator(layout, settings)?;
            let status = orchestrator.status()?;
            let flags = orchestrator.context().flags();
            let persistent = flags.get(KEY_STATUS)?;
            let our_id = orchestrator.context().our_id()?;
            for line in format_status_lines(&status, persistent.as_deref(), our_id.as_deref()) {
                println!("{line}");
            }
        }
        Commands::Event { event } => {
            let orchestrator = orchestrator(layout, settings)?;
            let reset = orchestrator.handle_event(event.into())?;
            for line in format_event_lines(event.into(), &reset) {
                println!("{line}");
            }
        }
        Commands::Reset { stage } => {
            let orchestrator = orchestrator(layout, settings)?;
            let reset = orchestrator.reset(stage)?;
            for line in format_reset_lines(stage, &reset) {
                println!("{line}");
            }
        }
        Commands::Txn { command } => {
            let installer = TxnInstaller::new(layout);
            match command {
                TxnCommands::ListModules => {
                    for module in installer.list_modules()? {
                        println!("{module}");
                    }
                }
                TxnCommands::Show { module } => {
                    let entries = installer.entries(&module)?;
                    for line in format_txn_entries(&module, &entries) {
                        println!("{line}");
                    }
                }
                TxnCommands::Rollback { module } => {
                    let summary = installer.rollback(&module)?;
                    for line in format_rollback_lines(&summary) {
                        println!("{line}");
                    }
                }
            }
        }
        Commands::PatchInterfaces { spec, file, module } => {
            let required = required_lines_from_spec(&spec)
                .with_context(|| format!("invalid interface list '{spec}'"))?;
            let target = match file {
                Some(file) => layout.host_path(file),
                None => layout.interfaces_path(),
            };
            let installer = TxnInstaller::new(layout);
            let changed = InterfacesPatcher::new(&installer, module.as_str())
                .patch(&target, &required)?;
            info!(path = %target.display(), changed, "patched the interfaces file");
            println!(
                "{}: {}",
                target.display(),
                if changed { "updated" } else { "unchanged" }
            );
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
