use std::path::PathBuf;

use spconverge_core::{is_truthy, ConvergeError, ConvergeResult, SP_USE_CGROUPS};
use tracing::debug;

use crate::resources::ResourcePartition;
use crate::StageContext;

/// Slices whose cgconfig files are generated, with their file names.
pub const CGCONFIG_FILES: &[&str] = &[
    "storpool.slice.conf",
    "system.slice.conf",
    "user.slice.conf",
    "machine.slice.conf",
];

struct Group<'a> {
    name: &'a str,
    cpus: String,
    mems: &'a str,
    memory_mib: Option<u64>,
    memsw_mib: Option<u64>,
}

fn render_group(group: &Group<'_>) -> String {
    let mut out = format!(
        "group {} {{\n    cpuset {{\n        cpuset.cpus = \"{}\";\n        cpuset.mems = \"{}\";\n    }}\n",
        group.name, group.cpus, group.mems
    );
    if let Some(memory) = group.memory_mib {
        out.push_str("    memory {\n");
        out.push_str(&format!("        memory.limit_in_bytes = \"{memory}M\";\n"));
        if let Some(memsw) = group.memsw_mib {
            out.push_str(&format!("        memory.memsw.limit_in_bytes = \"{memsw}M\";\n"));
        }
        out.push_str("    }\n");
    }
    out.push_str("}\n");
    out
}

/// The cgconfig files for `partition`, as `(file name, contents)` pairs in
/// [`CGCONFIG_FILES`] order.
pub fn render_cgconfig(partition: &ResourcePartition) -> Vec<(&'static str, String)> {
    let cpus = &partition.cpus;
    let mems = partition.numa_nodes.as_str();
    let memory = &partition.memory;

    let mut storpool = render_group(&Group {
        name: "storpool.slice",
        cpus: format!("{},{},{}", cpus.rdma, cpus.beacon, cpus.block),
        mems,
        memory_mib: Some(memory.storpool),
        memsw_mib: Some(memory.storpool),
    });
    for (name, cpu) in [
        ("storpool.slice/rdma", cpus.rdma),
        ("storpool.slice/beacon", cpus.beacon),
        ("storpool.slice/block", cpus.block),
    ] {
        storpool.push('\n');
        storpool.push_str(&render_group(&Group {
            name,
            cpus: cpu.to_string(),
            mems,
            memory_mib: None,
            memsw_mib: None,
        }));
    }
    storpool.push('\n');
    storpool.push_str(&render_group(&Group {
        name: "storpool.slice/common",
        cpus: cpus.rest.clone(),
        mems,
        memory_mib: None,
        memsw_mib: None,
    }));

    let slice = |name: &'static str, memory_mib: u64, memsw_mib: u64| {
        render_group(&Group {
            name,
            cpus: cpus.rest.clone(),
            mems,
            memory_mib: Some(memory_mib),
            memsw_mib: Some(memsw_mib),
        })
    };

    vec![
        ("storpool.slice.conf", storpool),
        ("system.slice.conf", slice("system.slice", memory.system, memory.system)),
        ("user.slice.conf", slice("user.slice", memory.user, memory.user)),
        (
            "machine.slice.conf",
            slice("machine.slice", memory.machine, partition.machine_memsw),
        ),
    ]
}

/// Verifies that storpool.conf enables cgroups and that every group listed
/// in `SP_<SERVICE>_CGROUPS` exists on this host.
pub fn check_cgroups(ctx: &StageContext, service: &str) -> ConvergeResult<()> {
    debug!(service, "checking the cgroup configuration");
    if ctx.bypassed("use_cgroups") {
        return Ok(());
    }

    let enabled = ctx
        .storpool_conf(SP_USE_CGROUPS)?
        .map(|value| is_truthy(&value))
        .unwrap_or(false);
    if !enabled {
        return Err(ConvergeError::precondition(format!(
            "the {SP_USE_CGROUPS} setting is not enabled in the StorPool configuration (bypass: use_cgroups)"
        )));
    }

    let var = format!("SP_{}_CGROUPS", service.to_ascii_uppercase());
    let spec = ctx.storpool_conf(&var)?.ok_or_else(|| {
        ConvergeError::precondition(format!("no {var} in the StorPool configuration"))
    })?;

    let missing = cgroup_paths(&var, &spec)?
        .into_iter()
        .map(|(controller, path)| ctx.layout().cgroup_fs_dir().join(controller).join(path))
        .filter(|path| !path.is_dir())
        .map(|path: PathBuf| path.display().to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ConvergeError::precondition(format!(
            "missing cgroups for {service}: {}",
            missing.join(" ")
        )));
    }
    Ok(())
}

/// Splits a `-g controller:path ...` list.
pub fn cgroup_paths(var: &str, spec: &str) -> ConvergeResult<Vec<(String, String)>> {
    spec.split_whitespace()
        .filter(|word| *word != "-g")
        .map(|word| match word.split_once(':') {
            Some((controller, path))
                if !controller.is_empty() && !path.is_empty() && !path.contains(':') =>
            {
                Ok((controller.to_string(), path.trim_start_matches('/').to_string()))
            }
            _ => Err(ConvergeError::precondition(format!(
                "unexpected component in {var}: {word}"
            ))),
        })
        .collect()
}
