//! Adds required directive lines to interface stanzas of an
//! `/etc/network/interfaces`-style configuration, following its `source`
//! and `source-directory` includes.

use std::collections::BTreeMap;

mod iface_spec;
mod patcher;

pub use iface_spec::{required_lines_from_spec, DEFAULT_MTU};
pub use patcher::InterfacesPatcher;

/// Interface name to the directive lines its stanza must contain.
pub type RequiredLines = BTreeMap<String, Vec<String>>;

#[cfg(test)]
mod tests;
