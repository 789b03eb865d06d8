// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

mod procfs;

pub use procfs::ArpEntry;

use crate::format;
use anyhow::{Context, Result};
use serde::Serialize;
use std::{collections::BTreeMap, fs, io, path, sync};

/// Interfaces whose counters are reported.
const INTERFACES: [&str; 8] = [
    "br-lan",
    "eth0",
    "ppp0",
    "tailscale0",
    "enp1s0",
    "enp2s0",
    "enp3s0",
    "enp4s0",
];

const ARP_MAC_NONE: &str = "00:00:00:00:00:00";
const ARP_FLAGS_INCOMPLETE: &str = "0x0";

#[derive(Clone, Debug, Serialize)]
pub struct Uptime {
    pub seconds: u64,
    pub formatted: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CpuInfo {
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub cores: u64,
    pub usage_percent: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryFormatted {
    pub total: String,
    pub used: String,
    pub available: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub percent: f64,
    pub formatted: MemoryFormatted,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrafficFormatted {
    pub rx: String,
    pub tx: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub formatted: TrafficFormatted,
}

/// Reads host state from procfs.
pub struct Linux {
    procfs_path: path::PathBuf,
    nprocs: u64,

    // previous /proc/stat sample for utilization deltas
    last_cpu: sync::Mutex<Option<procfs::CpuTimes>>,
}

fn usage_percent(prev: procfs::CpuTimes, cur: procfs::CpuTimes) -> f64 {
    let total = cur.total_ticks.saturating_sub(prev.total_ticks);
    if total == 0 {
        return 0.0;
    }
    let idle = cur.idle_ticks.saturating_sub(prev.idle_ticks);

    let usage = 100.0 * (1.0 - idle as f64 / total as f64);
    format::round1(usage.clamp(0.0, 100.0))
}

impl Linux {
    pub fn new(procfs_path: impl Into<path::PathBuf>) -> Self {
        Linux {
            procfs_path: procfs_path.into(),
            nprocs: crate::libc::sysconf_nprocs(),
            last_cpu: sync::Mutex::new(None),
        }
    }

    pub fn uptime(&self) -> Result<Uptime> {
        let seconds = self.parse_uptime()? as u64;

        Ok(Uptime {
            seconds,
            formatted: format::format_uptime(seconds),
        })
    }

    pub fn cpu(&self) -> Result<CpuInfo> {
        let [load_1, load_5, load_15] = self.parse_loadavg()?;

        let cur = self.parse_stat()?;
        let prev = self.last_cpu.lock().unwrap().replace(cur);
        let usage_percent = prev.map_or(0.0, |prev| usage_percent(prev, cur));

        Ok(CpuInfo {
            load_1,
            load_5,
            load_15,
            cores: self.nprocs,
            usage_percent,
        })
    }

    pub fn memory(&self) -> Result<MemoryInfo> {
        let meminfo = self.parse_meminfo()?;

        let total_bytes = meminfo.mem_total_kb * 1024;
        let available_bytes = meminfo.mem_avail_kb * 1024;
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let percent = if total_bytes > 0 {
            format::round1(used_bytes as f64 / total_bytes as f64 * 100.0)
        } else {
            0.0
        };

        Ok(MemoryInfo {
            total_bytes,
            used_bytes,
            available_bytes,
            percent,
            formatted: MemoryFormatted {
                total: format::format_bytes(total_bytes),
                used: format::format_bytes(used_bytes),
                available: format::format_bytes(available_bytes),
            },
        })
    }

    pub fn interface_stats(&self) -> Result<BTreeMap<String, InterfaceStats>> {
        let mut stats = BTreeMap::new();

        for dev in self.parse_net_dev()? {
            let dev = dev?;
            if !INTERFACES.contains(&dev.name.as_str()) {
                continue;
            }

            stats.insert(
                dev.name,
                InterfaceStats {
                    rx_bytes: dev.rx_bytes,
                    rx_packets: dev.rx_packets,
                    tx_bytes: dev.tx_bytes,
                    tx_packets: dev.tx_packets,
                    formatted: TrafficFormatted {
                        rx: format::format_bytes(dev.rx_bytes),
                        tx: format::format_bytes(dev.tx_bytes),
                    },
                },
            );
        }

        Ok(stats)
    }

    /// Returns the complete neighbor entries on `dev`.
    pub fn arp_table(&self, dev: &str) -> Result<Vec<ArpEntry>> {
        let mut entries = Vec::new();

        for entry in self.parse_net_arp()? {
            let entry = entry?;
            if entry.device != dev
                || entry.mac == ARP_MAC_NONE
                || entry.flags == ARP_FLAGS_INCOMPLETE
            {
                continue;
            }

            entries.push(entry);
        }

        Ok(entries)
    }

    fn procfs_open(&self, file: &str) -> Result<io::BufReader<fs::File>> {
        let path = self.procfs_path.join(file);
        let fp = fs::File::open(&path).with_context(|| format!("failed to open {:?}", path))?;
        Ok(io::BufReader::new(fp))
    }
}
