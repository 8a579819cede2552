use anyhow::{anyhow, Result};

use crate::RequiredLines;

pub const DEFAULT_MTU: &str = "9000";

fn vlan_lines(iface: &str, raw_device: &str, mtu: &str) -> Vec<String> {
    vec![
        format!("post-up /sbin/ip link set dev {raw_device} mtu {mtu}"),
        format!("post-up /sbin/ip link set dev {iface} mtu {mtu}"),
    ]
}

fn physical_lines(iface: &str, mtu: &str) -> Vec<String> {
    vec![
        format!("post-up /sbin/ip link set dev {iface} mtu {mtu}"),
        format!("post-up /sbin/ethtool -A {iface} autoneg off tx off rx on || true"),
        format!("post-up /sbin/ethtool -C {iface} rx-usecs 16 || true"),
        format!("post-up /sbin/ethtool -G {iface} rx 4096 tx 512 || true"),
    ]
}

/// Turns an `SP_IFACE` value such as `eth0=9000,eth1.100` into the lines
/// each storage interface needs.
///
/// A VLAN interface (`parent.vlan`) gets MTU lines for itself and its raw
/// device; the raw device also gets the physical tuning lines. Later
/// entries replace earlier ones for the same interface.
pub fn required_lines_from_spec(spec: &str) -> Result<RequiredLines> {
    let mut required = RequiredLines::new();

    for item in spec.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (iface, mtu) = match item.split_once('=') {
            Some((iface, mtu)) => (iface.trim(), mtu.trim()),
            None => (item, DEFAULT_MTU),
        };
        if iface.is_empty() {
            return Err(anyhow!("invalid interface entry '{item}': empty interface name"));
        }
        if mtu.is_empty() || !mtu.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("invalid interface entry '{item}': bad MTU '{mtu}'"));
        }

        match iface.split_once('.') {
            Some((parent, _)) if !parent.is_empty() => {
                required.insert(iface.to_string(), vlan_lines(iface, parent, mtu));
                required.insert(parent.to_string(), physical_lines(parent, mtu));
            }
            _ => {
                required.insert(iface.to_string(), physical_lines(iface, mtu));
            }
        }
    }

    Ok(required)
}
