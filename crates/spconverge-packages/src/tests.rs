use super::*;
use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use spconverge_core::{ConvergeError, HostLayout};
use tempfile::TempDir;

/// An in-memory package database: candidate versions, installed versions,
/// and "depends on" edges used both to pull in dependencies on install and
/// to refuse removals that would break an installed dependent.
#[derive(Default)]
struct FakeBackend {
    candidates: RefCell<BTreeMap<String, String>>,
    installed: RefCell<BTreeMap<String, String>>,
    depends: BTreeMap<String, Vec<String>>,
    broken_policy: BTreeSet<String>,
    broken_snapshot: bool,
    install_calls: RefCell<Vec<Vec<String>>>,
    purge_calls: RefCell<Vec<Vec<String>>>,
}

impl FakeBackend {
    fn with_candidate(self, name: &str, version: &str) -> Self {
        self.candidates
            .borrow_mut()
            .insert(name.to_string(), version.to_string());
        self
    }

    fn with_installed(self, name: &str, version: &str) -> Self {
        self.installed
            .borrow_mut()
            .insert(name.to_string(), version.to_string());
        self
    }

    fn with_dependency(mut self, name: &str, depends_on: &str) -> Self {
        self.depends
            .entry(name.to_string())
            .or_default()
            .push(depends_on.to_string());
        self
    }

    fn is_installed(&self, name: &str) -> bool {
        self.installed.borrow().contains_key(name)
    }

    fn install_one(&self, name: &str) -> Result<()> {
        let version = self
            .candidates
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no candidate for {name}"))?;
        self.installed
            .borrow_mut()
            .insert(name.to_string(), version);
        for dep in self.depends.get(name).into_iter().flatten() {
            if !self.is_installed(dep) {
                self.install_one(dep)?;
            }
        }
        Ok(())
    }
}

impl PackageBackend for FakeBackend {
    fn policy(&self, name: &str) -> Result<Option<PackagePolicy>> {
        if self.broken_policy.contains(name) {
            return Ok(None);
        }
        Ok(Some(PackagePolicy {
            installed: self.installed.borrow().get(name).cloned(),
            candidate: self.candidates.borrow().get(name).cloned(),
        }))
    }

    fn installed_versions(&self) -> Result<BTreeMap<String, String>> {
        if self.broken_snapshot {
            return Err(anyhow!("dpkg-query: status database area is locked"));
        }
        Ok(self.installed.borrow().clone())
    }

    fn install(&self, names: &[String]) -> Result<()> {
        self.install_calls.borrow_mut().push(names.to_vec());
        for name in names {
            self.install_one(name)?;
        }
        Ok(())
    }

    fn removal_dry_run(&self, names: &[String]) -> Result<bool> {
        let installed = self.installed.borrow();
        let blocked = installed.keys().filter(|pkg| !names.contains(pkg)).any(|pkg| {
            self.depends
                .get(pkg)
                .into_iter()
                .flatten()
                .any(|dep| names.contains(dep))
        });
        Ok(!blocked)
    }

    fn purge(&self, names: &[String]) -> Result<()> {
        self.purge_calls.borrow_mut().push(names.to_vec());
        let mut installed = self.installed.borrow_mut();
        for name in names {
            installed.remove(name);
        }
        Ok(())
    }

    fn update_index(&self) -> Result<()> {
        Ok(())
    }

    fn installed_package_files(&self, name: &str) -> Result<Vec<String>> {
        Ok(vec![format!("/usr/share/doc/{name}")])
    }

    fn package_depends(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.depends.get(name).cloned().unwrap_or_default())
    }
}

fn test_reconciler(backend: FakeBackend) -> (TempDir, PackageReconciler<FakeBackend>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let reconciler = PackageReconciler::new(backend, &HostLayout::new(dir.path()), "spconverge");
    (dir, reconciler)
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(ToString::to_string).collect()
}

fn policies(entries: &[(&str, Option<PackagePolicy>)]) -> BTreeMap<String, Option<PackagePolicy>> {
    entries
        .iter()
        .map(|(name, policy)| (name.to_string(), policy.clone()))
        .collect()
}

#[test]
fn parse_apt_cache_policy_output() {
    let raw = "storpool-beacon-18.01:\n  Installed: (none)\n  Candidate: 18.01.1\n  Version table:\n     18.01.1 500\n        500 http://repo.storpool.com/ bionic/main amd64 Packages\n";
    let policy = parse_policy(raw).expect("must parse");
    assert_eq!(policy, PackagePolicy::new(None, Some("18.01.1")));

    assert_eq!(parse_policy("N: Unable to locate package x\n"), None);
    assert_eq!(
        parse_policy("  Installed: 1\n  Installed: 2\n  Candidate: 2\n"),
        None
    );
}

#[test]
fn parse_dpkg_query_keeps_only_installed_rows() {
    let raw = "txn-install\t1.0.1\tinstall ok installed\nold-pkg\t0.9\tdeinstall ok config-files\nbroken line\n\n";
    let parsed = parse_installed_versions(raw);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed.get("txn-install").map(String::as_str), Some("1.0.1"));
}

#[test]
fn version_constraint_parsing() {
    assert_eq!(VersionConstraint::parse("*"), VersionConstraint::Any);
    assert_eq!(
        VersionConstraint::parse("18.01.1"),
        VersionConstraint::Exact("18.01.1".to_string())
    );
    assert_eq!(VersionConstraint::Any.to_string(), "*");
}

#[test]
fn plan_skips_satisfied_and_selects_missing() {
    let requests = request([
        ("storpool-cli-18.01", "*"),
        ("storpool-common-18.01", "18.01.1"),
        ("txn-install", "*"),
    ]);
    let planned = plan_installation(
        &requests,
        &policies(&[
            ("storpool-cli-18.01", Some(PackagePolicy::new(None, Some("18.01.1")))),
            (
                "storpool-common-18.01",
                Some(PackagePolicy::new(Some("18.01.1"), Some("18.01.2"))),
            ),
            ("txn-install", Some(PackagePolicy::new(Some("1.0"), Some("1.0")))),
        ]),
    )
    .expect("plan must succeed");
    assert_eq!(planned, vec!["storpool-cli-18.01"]);
}

#[test]
fn plan_reports_each_failure_kind() {
    let requests = request([("storpool-config-18.01", "18.01.1")]);

    let err = plan_installation(&requests, &policies(&[("storpool-config-18.01", None)]))
        .expect_err("unknown policy");
    assert!(matches!(err, PlanError::UnknownPolicy { .. }));

    let err = plan_installation(
        &requests,
        &policies(&[("storpool-config-18.01", Some(PackagePolicy::new(None, None)))]),
    )
    .expect_err("unavailable");
    assert!(matches!(err, PlanError::Unavailable { .. }));

    let err = plan_installation(
        &requests,
        &policies(&[(
            "storpool-config-18.01",
            Some(PackagePolicy::new(Some("18.01.0"), Some("18.01.2"))),
        )]),
    )
    .expect_err("mismatch");
    assert_eq!(
        err.to_string(),
        "the 18.01.1 version of the storpool-config-18.01 package is not available in the repositories, found candidate 18.01.2 instead"
    );
    assert_eq!(err.package(), "storpool-config-18.01");
}

#[test]
fn wildcard_upgrades_to_a_newer_candidate_but_keeps_orphaned_installs() {
    let requests = request([("a", "*"), ("b", "*")]);
    let planned = plan_installation(
        &requests,
        &policies(&[
            ("a", Some(PackagePolicy::new(Some("1"), Some("2")))),
            ("b", Some(PackagePolicy::new(Some("1"), None))),
        ]),
    )
    .expect("plan");
    assert_eq!(planned, vec!["a"]);
}

#[test]
fn beacon_install_record_unrecord_scenario() {
    let backend = FakeBackend::default()
        .with_candidate("storpool-beacon-18.01", "18.01.1")
        .with_candidate("storpool-common-18.01", "18.01.1")
        .with_dependency("storpool-beacon-18.01", "storpool-common-18.01");
    let (_dir, reconciler) = test_reconciler(backend);

    let installed = reconciler
        .install(&request([("storpool-beacon-18.01", "*")]))
        .expect("install must succeed");
    assert_eq!(
        installed,
        names(&["storpool-beacon-18.01", "storpool-common-18.01"])
    );

    reconciler
        .record("storpool-beacon", installed.iter().cloned())
        .expect("record");
    let record = reconciler
        .store()
        .read()
        .expect("read")
        .expect("record exists");
    assert_eq!(
        record.layer_packages("spconverge", "storpool-beacon"),
        installed
    );

    let removed = reconciler.unrecord("storpool-beacon").expect("unrecord");
    assert_eq!(removed, installed);
    assert!(!reconciler.backend().is_installed("storpool-beacon-18.01"));
    assert!(!reconciler.backend().is_installed("storpool-common-18.01"));
    // The dependency could only go once its dependent was gone.
    assert_eq!(reconciler.backend().purge_calls.borrow().len(), 2);

    let record = reconciler.store().read().expect("read").expect("record");
    assert!(record.charms.is_empty());
    assert!(record.packages.remove.is_empty());
}

#[test]
fn second_install_is_a_no_op() {
    let backend = FakeBackend::default().with_candidate("txn-install", "1.0.1");
    let (_dir, reconciler) = test_reconciler(backend);
    let requests = request([("txn-install", "*")]);

    assert_eq!(
        reconciler.install(&requests).expect("first"),
        names(&["txn-install"])
    );
    assert!(reconciler.install(&requests).expect("second").is_empty());
    assert_eq!(reconciler.backend().install_calls.borrow().len(), 1);
}

#[test]
fn plan_failures_become_install_failures() {
    let backend = FakeBackend::default().with_candidate("storpool-block-18.01", "18.01.2");
    let (_dir, reconciler) = test_reconciler(backend);

    let err = reconciler
        .install(&request([("storpool-block-18.01", "18.01.1")]))
        .expect_err("mismatch must fail");
    match err {
        ConvergeError::PackageInstallFailure { names, cause } => {
            assert_eq!(names, vec!["storpool-block-18.01"]);
            assert!(cause.contains("found candidate 18.01.2"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(reconciler.backend().install_calls.borrow().is_empty());
}

#[test]
fn shared_packages_survive_until_the_last_owner_goes() {
    let backend = FakeBackend::default()
        .with_installed("storpool-common-18.01", "18.01.1")
        .with_installed("storpool-beacon-18.01", "18.01.1")
        .with_installed("storpool-block-18.01", "18.01.1");
    let (_dir, reconciler) = test_reconciler(backend);

    reconciler
        .record("storpool-beacon", ["storpool-beacon-18.01", "storpool-common-18.01"])
        .expect("record beacon");
    reconciler
        .record("storpool-block", ["storpool-block-18.01", "storpool-common-18.01"])
        .expect("record block");

    let removed = reconciler.unrecord("storpool-block").expect("unrecord block");
    assert_eq!(removed, names(&["storpool-block-18.01"]));
    assert!(reconciler.backend().is_installed("storpool-common-18.01"));

    let removed = reconciler.unrecord("storpool-beacon").expect("unrecord beacon");
    assert_eq!(
        removed,
        names(&["storpool-beacon-18.01", "storpool-common-18.01"])
    );
}

#[test]
fn blocked_removals_stay_candidates_until_rerecorded() {
    let backend = FakeBackend::default()
        .with_installed("libfoo", "1")
        .with_installed("foreign-tool", "1")
        .with_dependency("foreign-tool", "libfoo");
    let (_dir, reconciler) = test_reconciler(backend);

    reconciler.record("storpool-config", ["libfoo"]).expect("record");
    let removed = reconciler.unrecord("storpool-config").expect("unrecord");
    assert!(removed.is_empty());

    let record = reconciler.store().read().expect("read").expect("record");
    assert_eq!(record.packages.remove, names(&["libfoo"]));

    reconciler.record("storpool-common", ["libfoo"]).expect("record again");
    let record = reconciler.store().read().expect("read").expect("record");
    assert!(record.packages.remove.is_empty());
}

#[test]
fn co_removal_group_is_purged_together() {
    let backend = FakeBackend::default()
        .with_installed("libwww-perl", "6")
        .with_installed("liblwp-protocol-https-perl", "6")
        .with_dependency("libwww-perl", "liblwp-protocol-https-perl")
        .with_dependency("liblwp-protocol-https-perl", "libwww-perl");
    let (_dir, reconciler) = test_reconciler(backend);

    reconciler
        .record("storpool-common", ["libwww-perl", "liblwp-protocol-https-perl"])
        .expect("record");
    let removed = reconciler.unrecord("storpool-common").expect("unrecord");
    assert_eq!(
        removed,
        names(&["liblwp-protocol-https-perl", "libwww-perl"])
    );
    assert_eq!(
        reconciler.backend().purge_calls.borrow().first().map(Vec::len),
        Some(2)
    );
}

#[test]
fn ownership_conservation_over_record_sequences() {
    let mut record = OwnershipRecord::default();
    record.record("spconverge", "a", ["p1", "p2"]);
    record.record("spconverge", "b", ["p2", "p3"]);
    record.record("other", "c", ["p3"]);

    let freed = record.drop_layer("spconverge", "a");
    assert_eq!(record.removal_candidates(&freed), names(&["p1"]));

    let freed = record.drop_layer("spconverge", "b");
    assert_eq!(record.removal_candidates(&freed), names(&["p2"]));
    assert!(!record.charms.contains_key("spconverge"));

    let freed = record.drop_layer("other", "c");
    assert_eq!(record.removal_candidates(&freed), names(&["p3"]));
}

#[test]
fn ownership_file_uses_the_shared_json_shape() {
    let (dir, reconciler) = test_reconciler(FakeBackend::default());
    reconciler
        .record("storpool-config", ["txn-install"])
        .expect("record");

    let raw = fs::read_to_string(dir.path().join("var/lib/storpool/install-charms.json"))
        .expect("read record file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(
        value["charms"]["spconverge"]["layers"]["storpool-config"]["packages"],
        serde_json::json!(["txn-install"])
    );
    assert_eq!(value["packages"]["remove"], serde_json::json!([]));
}

#[test]
fn unrecord_without_a_record_file_does_nothing() {
    let (dir, reconciler) = test_reconciler(FakeBackend::default());
    assert!(reconciler.unrecord("storpool-block").expect("unrecord").is_empty());
    assert!(!dir.path().join("var/lib/storpool/install-charms.json").exists());
}

#[test]
fn parse_depends_keeps_plain_names() {
    assert_eq!(
        parse_depends("python3:any (>= 3.6~), txn-install, libc6 (>= 2.14) | libc6-udeb"),
        vec!["python3", "txn-install", "libc6"]
    );
    assert!(parse_depends("").is_empty());
}

#[test]
fn failed_version_snapshot_is_an_install_failure() {
    let backend = FakeBackend {
        broken_snapshot: true,
        ..FakeBackend::default()
    }
    .with_candidate("storpool-beacon-18.01", "18.01.1");
    let (_dir, reconciler) = test_reconciler(backend);

    let err = reconciler
        .install(&request([("storpool-beacon-18.01", "18.01.1")]))
        .expect_err("snapshot must fail");
    match err {
        ConvergeError::PackageInstallFailure { names, cause } => {
            assert_eq!(names, vec!["storpool-beacon-18.01".to_string()]);
            assert!(cause.contains("locked"), "cause: {cause}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(reconciler.backend().install_calls.borrow().is_empty());
}

#[test]
fn dependencies_and_files_come_from_the_backend() {
    let backend = FakeBackend::default()
        .with_dependency("storpool-openstack-integration", "python-storpool-spopenstack");
    let (_dir, reconciler) = test_reconciler(backend);
    assert_eq!(
        reconciler
            .package_depends("storpool-openstack-integration")
            .expect("depends"),
        vec!["python-storpool-spopenstack"]
    );
    assert_eq!(
        reconciler.package_files("txn-install").expect("files"),
        vec!["/usr/share/doc/txn-install"]
    );
}
