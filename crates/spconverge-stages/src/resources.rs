use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;

use spconverge_core::{ConvergeError, ConvergeResult, HostLayout};

/// Memory (MiB) held back from the machine slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceReserve {
    pub system: u64,
    pub user: u64,
    pub storpool: u64,
    pub kernel: u64,
}

impl ResourceReserve {
    pub const PRODUCTION: Self = Self {
        system: 4 * 1024,
        user: 4 * 1024,
        storpool: 1024,
        kernel: 10 * 1024,
    };

    /// Used with the `very_little_memory` bypass.
    pub const DEVELOPMENT: Self = Self {
        system: 1900,
        user: 512,
        storpool: 1024,
        kernel: 512,
    };

    pub fn total(&self) -> u64 {
        self.system + self.user + self.storpool + self.kernel
    }
}

impl Default for ResourceReserve {
    fn default() -> Self {
        Self::PRODUCTION
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuAssignment {
    pub rdma: u32,
    pub beacon: u32,
    pub block: u32,
    /// `first-last` range for everything else.
    pub rest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPartition {
    pub system: u64,
    pub user: u64,
    pub storpool: u64,
    pub machine: u64,
}

/// Everything the cgroup configuration is generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePartition {
    pub cpus: CpuAssignment,
    pub memory: MemoryPartition,
    /// Machine slice memory plus all swap, in MiB.
    pub machine_memsw: u64,
    pub numa_nodes: String,
}

impl ResourcePartition {
    /// Reads the live CPU, memory and swap figures of the host.
    pub fn from_host(
        layout: &HostLayout,
        pad_cpus: bool,
        reserve: ResourceReserve,
    ) -> ConvergeResult<Self> {
        let cpuinfo = read_proc(&layout.proc_cpuinfo())?;
        let meminfo = read_proc(&layout.proc_meminfo())?;
        let swaps = match fs::read_to_string(layout.proc_swaps()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", layout.proc_swaps().display()))
                    .into());
            }
        };
        let numa_path = layout.host_path("/sys/devices/system/node/online");
        let numa_nodes = fs::read_to_string(&numa_path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| "0".to_string());

        let cpus = assign_cpus(parse_cpu_list(&cpuinfo), pad_cpus)?;
        let memory = partition_memory(parse_mem_total_mib(&meminfo)?, reserve)?;
        let swap_mib = parse_swap_total_kib(&swaps) / 1024;
        Ok(Self {
            machine_memsw: memory.machine + swap_mib,
            cpus,
            memory,
            numa_nodes,
        })
    }
}

fn read_proc(path: &std::path::Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Sorted processor numbers from `/proc/cpuinfo`.
pub fn parse_cpu_list(cpuinfo: &str) -> Vec<u32> {
    let mut cpus = cpuinfo
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() != "processor" {
                return None;
            }
            value.trim().parse::<u32>().ok()
        })
        .collect::<Vec<_>>();
    cpus.sort_unstable();
    cpus
}

pub fn assign_cpus(mut cpus: Vec<u32>, pad: bool) -> ConvergeResult<CpuAssignment> {
    if pad {
        if let Some(last) = cpus.last().copied() {
            cpus.extend([last, last, last]);
        }
    }
    if cpus.len() < 4 {
        return Err(ConvergeError::precondition("not enough CPUs, need at least 4"));
    }
    Ok(CpuAssignment {
        rdma: cpus[0],
        beacon: cpus[1],
        block: cpus[2],
        rest: format!("{}-{}", cpus[3], cpus[cpus.len() - 1]),
    })
}

/// `MemTotal` converted to MiB.
pub fn parse_mem_total_mib(meminfo: &str) -> Result<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.split_whitespace().next() == Some("MemTotal:"))
        .ok_or_else(|| anyhow!("could not find MemTotal in the memory information"))?;
    let mut words = line.split_whitespace().skip(1);
    let amount = words
        .next()
        .ok_or_else(|| anyhow!("no MemTotal value in '{line}'"))?
        .parse::<u64>()
        .with_context(|| format!("invalid MemTotal value in '{line}'"))?;
    let unit = words.next().unwrap_or("").to_ascii_uppercase();
    match unit.chars().next() {
        Some('K') => Ok(amount / 1024),
        Some('M') => Ok(amount),
        Some('G') => Ok(amount * 1024),
        _ => Err(anyhow!("could not parse the '{unit}' unit for MemTotal")),
    }
}

/// Sum of the `Size` column of `/proc/swaps`, in KiB.
pub fn parse_swap_total_kib(swaps: &str) -> u64 {
    swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(2)?.parse::<u64>().ok())
        .sum()
}

pub fn partition_memory(total: u64, reserve: ResourceReserve) -> ConvergeResult<MemoryPartition> {
    let reserved = reserve.total();
    if total <= reserved {
        return Err(ConvergeError::precondition(format!(
            "not enough memory, only have {total}M, need {reserved}M"
        )));
    }
    Ok(MemoryPartition {
        system: reserve.system,
        user: reserve.user,
        storpool: reserve.storpool,
        machine: total - reserved,
    })
}
