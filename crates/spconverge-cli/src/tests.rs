use super::*;
use clap::error::ErrorKind;
use std::fs;
use std::path::PathBuf;

use spconverge_stages::{Outcome, StageState};
use spconverge_txn::{RollbackSummary, TxnEntry};

use crate::completion::write_completions_script;
use crate::dispatch::load_settings;
use crate::render::{
    format_event_lines, format_outcome_line, format_rollback_lines, format_status_lines,
    format_txn_entries,
};

#[test]
fn converge_defaults_to_the_entry_stage() {
    let cli = Cli::try_parse_from(["spconverge", "converge"]).expect("must parse");
    assert_eq!(cli.root, PathBuf::from("/"));
    assert_eq!(cli.settings, PathBuf::from(DEFAULT_SETTINGS_PATH));
    match cli.command {
        Commands::Converge { stage } => assert_eq!(stage, None),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn stage_arguments_are_validated() {
    let cli = Cli::try_parse_from(["spconverge", "teardown", "beacon", "--root", "/srv/host"])
        .expect("must parse");
    assert_eq!(cli.root, PathBuf::from("/srv/host"));
    match cli.command {
        Commands::Teardown { stage } => assert_eq!(stage, Some(StageId::Beacon)),
        other => panic!("unexpected command: {other:?}"),
    }

    let err = Cli::try_parse_from(["spconverge", "reset", "storage"]).expect_err("bad stage");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
    assert!(err.to_string().contains("unknown stage 'storage'"));
}

#[test]
fn global_overrides_repeat() {
    let cli = Cli::try_parse_from([
        "spconverge",
        "status",
        "--set",
        "storpool_version=18.01.1",
        "--set",
        "bypassed_checks=use_cgroups",
    ])
    .expect("must parse");
    assert_eq!(
        cli.overrides,
        vec!["storpool_version=18.01.1", "bypassed_checks=use_cgroups"]
    );
}

#[test]
fn event_and_txn_subcommands_parse() {
    let cli = Cli::try_parse_from(["spconverge", "event", "config-changed"]).expect("event");
    match cli.command {
        Commands::Event { event } => {
            assert_eq!(HookEvent::from(event), HookEvent::ConfigChanged);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["spconverge", "txn", "rollback", "charm-storpool-config"])
        .expect("txn");
    match cli.command {
        Commands::Txn {
            command: TxnCommands::Rollback { module },
        } => assert_eq!(module, "charm-storpool-config"),
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["spconverge", "patch-interfaces", "--spec", "eth0=1500"])
        .expect("patch");
    match cli.command {
        Commands::PatchInterfaces { spec, file, module } => {
            assert_eq!(spec, "eth0=1500");
            assert_eq!(file, None);
            assert_eq!(module, "charm-storpool-config");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn settings_overrides_shadow_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.toml");
    fs::write(
        &path,
        "storpool_version = \"18.01.1\"\nstorpool_repo_url = \"http://repo\"\n",
    )
    .expect("write settings");

    let settings =
        load_settings(&path, &["storpool_version=19.01.2".to_string()]).expect("settings");
    assert_eq!(settings.string("storpool_version"), Some("19.01.2"));
    assert_eq!(settings.string("storpool_repo_url"), Some("http://repo"));

    let missing = load_settings(&dir.path().join("absent.toml"), &[]).expect("no file");
    assert_eq!(missing.string("storpool_version"), None);
    assert!(load_settings(&path, &["broken".to_string()]).is_err());
}

#[test]
fn completions_name_the_binary() {
    let mut out = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut out).expect("completions");
    let script = String::from_utf8(out).expect("utf8");
    assert!(script.contains("spconverge"));
    assert!(script.contains("converge"));
}

#[test]
fn status_lines_align_stage_names() {
    let lines = format_status_lines(
        &[
            (StageId::RepoAdd, StageState::Converged),
            (StageId::OpenStackIntegration, StageState::Pending),
        ],
        Some("beacon: fault: boom"),
        Some("11"),
    );
    assert_eq!(
        lines,
        vec![
            "repo-add               converged",
            "openstack-integration  pending",
            "our id: 11",
            "last error: beacon: fault: boom",
        ]
    );
}

#[test]
fn outcome_and_event_lines() {
    assert_eq!(
        format_outcome_line(StageId::Block, &Outcome::Blocked { by: StageId::Beacon }),
        "block: blocked by the stopped beacon stage"
    );
    assert_eq!(
        format_event_lines(HookEvent::UpgradeCharm, &[]),
        vec!["UpgradeCharm: nothing to reset"]
    );
    assert_eq!(
        format_event_lines(HookEvent::ConfigChanged, &[StageId::Config]),
        vec!["ConfigChanged: config is pending again"]
    );
}

#[test]
fn txn_lines_describe_entries_and_rollbacks() {
    let entries = vec![
        TxnEntry {
            path: PathBuf::from("/etc/storpool.conf"),
            backup: None,
            sha256: "abc".to_string(),
            installed_at_unix: 7,
            prior_mode: None,
            prior_uid: None,
            prior_gid: None,
            removed: false,
        },
        TxnEntry {
            path: PathBuf::from("/etc/apt/sources.list.d/storpool-maas.list"),
            backup: Some(PathBuf::from(
                "/var/lib/spconverge/txn/backups/charm-storpool-repo-add/0000",
            )),
            sha256: String::new(),
            installed_at_unix: 9,
            prior_mode: Some(0o644),
            prior_uid: Some(0),
            prior_gid: Some(0),
            removed: true,
        },
    ];
    assert_eq!(
        format_txn_entries("charm-storpool-config", &entries),
        vec![
            "/etc/storpool.conf sha256=abc installed_at=7 new",
            "/etc/apt/sources.list.d/storpool-maas.list removed_at=9 backup=/var/lib/spconverge/txn/backups/charm-storpool-repo-add/0000",
        ]
    );
    assert_eq!(
        format_txn_entries("charm-storpool-config", &[]),
        vec!["charm-storpool-config: no recorded files"]
    );

    let summary = RollbackSummary {
        module: "charm-storpool-config".to_string(),
        restored: vec![PathBuf::from("/etc/network/interfaces")],
        removed: vec![PathBuf::from("/etc/storpool.conf")],
    };
    assert_eq!(
        format_rollback_lines(&summary),
        vec![
            "restored /etc/network/interfaces",
            "removed /etc/storpool.conf",
        ]
    );
}
