use spconverge_stages::{HookEvent, Outcome, StageId, StageState};
use spconverge_txn::{RollbackSummary, TxnEntry};

pub(crate) fn format_outcome_line(stage: StageId, outcome: &Outcome) -> String {
    format!("{stage}: {outcome}")
}

pub(crate) fn format_status_lines(
    status: &[(StageId, StageState)],
    persistent: Option<&str>,
    our_id: Option<&str>,
) -> Vec<String> {
    let width = status
        .iter()
        .map(|(stage, _)| stage.as_str().len())
        .max()
        .unwrap_or(0);
    let mut lines = status
        .iter()
        .map(|(stage, state)| format!("{:<width$}  {state}", stage.as_str()))
        .collect::<Vec<_>>();
    if let Some(our_id) = our_id {
        lines.push(format!("our id: {our_id}"));
    }
    if let Some(persistent) = persistent {
        lines.push(format!("last error: {persistent}"));
    }
    lines
}

pub(crate) fn format_event_lines(event: HookEvent, reset: &[StageId]) -> Vec<String> {
    if reset.is_empty() {
        return vec![format!("{event:?}: nothing to reset")];
    }
    reset
        .iter()
        .map(|stage| format!("{event:?}: {stage} is pending again"))
        .collect()
}

pub(crate) fn format_reset_lines(stage: StageId, reset: &[StageId]) -> Vec<String> {
    if reset.is_empty() {
        return vec![format!("{stage}: already pending")];
    }
    reset
        .iter()
        .map(|stage| format!("{stage}: pending"))
        .collect()
}

pub(crate) fn format_txn_entries(module: &str, entries: &[TxnEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec![format!("{module}: no recorded files")];
    }
    entries
        .iter()
        .map(|entry| {
            let prior = match &entry.backup {
                Some(backup) => format!("backup={}", backup.display()),
                None => "new".to_string(),
            };
            if entry.removed {
                return format!(
                    "{} removed_at={} {prior}",
                    entry.path.display(),
                    entry.installed_at_unix
                );
            }
            format!(
                "{} sha256={} installed_at={} {prior}",
                entry.path.display(),
                entry.sha256,
                entry.installed_at_unix
            )
        })
        .collect()
}

pub(crate) fn format_rollback_lines(summary: &RollbackSummary) -> Vec<String> {
    if summary.is_empty() {
        return vec![format!("{}: nothing to roll back", summary.module)];
    }
    let restored = summary
        .restored
        .iter()
        .map(|path| format!("restored {}", path.display()));
    let removed = summary
        .removed
        .iter()
        .map(|path| format!("removed {}", path.display()));
    restored.chain(removed).collect()
}
