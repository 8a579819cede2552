use super::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use spconverge_core::HostLayout;
use spconverge_txn::TxnInstaller;
use tempfile::TempDir;

const MODULE: &str = "charm-storpool-config";

fn test_installer() -> (TempDir, TxnInstaller) {
    let dir = tempfile::tempdir().expect("tempdir");
    let installer = TxnInstaller::new(HostLayout::new(dir.path()));
    (dir, installer)
}

fn write_host_file(installer: &TxnInstaller, path: &str, contents: &str) -> PathBuf {
    let path = installer.layout().host_path(path);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, contents).expect("write");
    path
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("read")
}

fn required(entries: &[(&str, &[&str])]) -> RequiredLines {
    entries
        .iter()
        .map(|(iface, lines)| {
            (
                iface.to_string(),
                lines.iter().map(ToString::to_string).collect(),
            )
        })
        .collect()
}

#[test]
fn appends_missing_mtu_line_to_eth0_stanza_once() {
    let (_dir, installer) = test_installer();
    let interfaces = write_host_file(
        &installer,
        "/etc/network/interfaces",
        "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet static\n    address 10.0.0.5/24\n",
    );
    let wanted = required(&[("eth0", &["post-up ip link set dev eth0 mtu 9000"])]);
    let patcher = InterfacesPatcher::new(&installer, MODULE);

    assert!(patcher.patch(&interfaces, &wanted).expect("first patch"));
    let patched = read(&interfaces);
    assert_eq!(
        patched,
        "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet static\n    address 10.0.0.5/24\npost-up ip link set dev eth0 mtu 9000\n"
    );

    assert!(!patcher.patch(&interfaces, &wanted).expect("second patch"));
    assert_eq!(read(&interfaces), patched);
}

#[test]
fn missing_lines_land_before_the_next_stanza_and_present_ones_are_kept() {
    let (_dir, installer) = test_installer();
    let interfaces = write_host_file(
        &installer,
        "/etc/network/interfaces",
        "iface eth1 inet manual\n  post-up /sbin/ip link set dev eth1 mtu 9000\nauto eth2\niface eth2 inet dhcp\n# trailing comment\n",
    );
    let wanted = required_lines_from_spec("eth1").expect("spec");
    let patcher = InterfacesPatcher::new(&installer, MODULE);

    assert!(patcher.patch(&interfaces, &wanted).expect("patch"));
    let lines = read(&interfaces);
    let lines = lines.lines().collect::<Vec<_>>();
    assert_eq!(
        lines,
        vec![
            "iface eth1 inet manual",
            "  post-up /sbin/ip link set dev eth1 mtu 9000",
            "post-up /sbin/ethtool -A eth1 autoneg off tx off rx on || true",
            "post-up /sbin/ethtool -C eth1 rx-usecs 16 || true",
            "post-up /sbin/ethtool -G eth1 rx 4096 tx 512 || true",
            "auto eth2",
            "iface eth2 inet dhcp",
            "# trailing comment",
        ]
    );
}

#[test]
fn end_of_file_without_newline_inside_stanza() {
    let (_dir, installer) = test_installer();
    let interfaces = write_host_file(
        &installer,
        "/etc/network/interfaces",
        "iface eth0 inet manual",
    );
    let wanted = required(&[("eth0", &["mtu 9000"])]);

    assert!(InterfacesPatcher::new(&installer, MODULE)
        .patch(&interfaces, &wanted)
        .expect("patch"));
    assert_eq!(read(&interfaces), "iface eth0 inet manual\nmtu 9000\n");
}

#[test]
fn follows_source_and_source_directory_includes() {
    let (_dir, installer) = test_installer();
    let interfaces = write_host_file(
        &installer,
        "/etc/network/interfaces",
        "source /etc/network/interfaces.d/*.cfg\nsource-directory /etc/network/more.d\n",
    );
    let eth0 = write_host_file(
        &installer,
        "/etc/network/interfaces.d/eth0.cfg",
        "iface eth0 inet manual\n",
    );
    let ignored = write_host_file(
        &installer,
        "/etc/network/interfaces.d/eth0.txt",
        "iface eth0 inet manual\n",
    );
    let eth1 = write_host_file(
        &installer,
        "/etc/network/more.d/eth1",
        "iface eth1 inet manual\n",
    );
    fs::create_dir_all(installer.layout().host_path("/etc/network/more.d/subdir")).expect("mkdir");

    let wanted = required(&[("eth0", &["mtu 9000"]), ("eth1", &["mtu 1500"])]);
    assert!(InterfacesPatcher::new(&installer, MODULE)
        .patch(&interfaces, &wanted)
        .expect("patch"));

    assert_eq!(read(&eth0), "iface eth0 inet manual\nmtu 9000\n");
    assert_eq!(read(&eth1), "iface eth1 inet manual\nmtu 1500\n");
    assert_eq!(read(&ignored), "iface eth0 inet manual\n");
    assert_eq!(
        read(&interfaces),
        "source /etc/network/interfaces.d/*.cfg\nsource-directory /etc/network/more.d\n"
    );
}

#[test]
fn include_cycles_are_processed_once() {
    let (_dir, installer) = test_installer();
    let interfaces = write_host_file(
        &installer,
        "/etc/network/interfaces",
        "source interfaces\nsource extra\niface eth0 inet manual\n",
    );
    let extra = write_host_file(
        &installer,
        "/etc/network/extra",
        "source /etc/network/interfaces\niface eth0 inet manual\n",
    );

    let wanted = required(&[("eth0", &["mtu 9000"])]);
    let patcher = InterfacesPatcher::new(&installer, MODULE);
    assert!(patcher.patch(&interfaces, &wanted).expect("patch"));

    assert_eq!(
        read(&interfaces),
        "source interfaces\nsource extra\niface eth0 inet manual\nmtu 9000\n"
    );
    assert_eq!(
        read(&extra),
        "source /etc/network/interfaces\niface eth0 inet manual\nmtu 9000\n"
    );
    assert!(!patcher.patch(&interfaces, &wanted).expect("repatch"));
}

#[test]
fn patched_files_keep_their_mode_and_roll_back() {
    let (_dir, installer) = test_installer();
    let original = "iface eth0 inet manual\n";
    let interfaces = write_host_file(&installer, "/etc/network/interfaces", original);
    fs::set_permissions(&interfaces, fs::Permissions::from_mode(0o600)).expect("chmod");

    let wanted = required_lines_from_spec("eth0=1500").expect("spec");
    assert!(InterfacesPatcher::new(&installer, MODULE)
        .patch(&interfaces, &wanted)
        .expect("patch"));
    assert_eq!(
        fs::metadata(&interfaces).expect("stat").permissions().mode() & 0o777,
        0o600
    );
    assert!(read(&interfaces).contains("post-up /sbin/ip link set dev eth0 mtu 1500\n"));

    installer.rollback(MODULE).expect("rollback");
    assert_eq!(read(&interfaces), original);
}

#[test]
fn unrequested_stanzas_are_left_alone() {
    let (_dir, installer) = test_installer();
    let contents = "auto eth3\niface eth3 inet dhcp\n\tmtu 1400\nallow-hotplug eth4\n";
    let interfaces = write_host_file(&installer, "/etc/network/interfaces", contents);

    let wanted = required(&[("eth0", &["mtu 9000"])]);
    assert!(!InterfacesPatcher::new(&installer, MODULE)
        .patch(&interfaces, &wanted)
        .expect("patch"));
    assert_eq!(read(&interfaces), contents);
    assert!(installer.list_modules().expect("list").is_empty());
}

#[test]
fn iface_spec_expands_vlans_and_default_mtu() {
    let lines = required_lines_from_spec("eth0, eth1.100=1500").expect("spec");
    assert_eq!(
        lines.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["eth0", "eth1", "eth1.100"]
    );
    assert_eq!(
        lines["eth0"][0],
        format!("post-up /sbin/ip link set dev eth0 mtu {DEFAULT_MTU}")
    );
    assert_eq!(
        lines["eth1.100"],
        vec![
            "post-up /sbin/ip link set dev eth1 mtu 1500".to_string(),
            "post-up /sbin/ip link set dev eth1.100 mtu 1500".to_string(),
        ]
    );
    assert_eq!(lines["eth1"].len(), 4);
    assert_eq!(
        lines["eth1"][3],
        "post-up /sbin/ethtool -G eth1 rx 4096 tx 512 || true"
    );

    assert!(required_lines_from_spec("=9000").is_err());
    assert!(required_lines_from_spec("eth0=jumbo").is_err());
    assert!(required_lines_from_spec("").expect("empty").is_empty());
}
