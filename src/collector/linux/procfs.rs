// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    io::{self, BufRead, Read},
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(super) struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_avail_kb: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct CpuTimes {
    pub idle_ticks: u64,
    pub total_ticks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct NetDev {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: String,
    pub flags: String,
    pub mac: String,
    pub device: String,
}

fn parse_uptime(s: &str) -> Result<f64> {
    // 0:uptime 1:idle
    s.split_ascii_whitespace()
        .next()
        .and_then(|col| col.parse().ok())
        .ok_or_else(|| anyhow!("failed to parse uptime"))
}

fn parse_loadavg(s: &str) -> Result<[f64; 3]> {
    // 0:load1 1:load5 2:load15 3:running/total 4:last_pid
    let cols: Vec<&str> = s.split_ascii_whitespace().collect();
    if cols.len() < 3 {
        return Err(anyhow!("failed to parse loadavg"));
    }

    let mut loads = [0.0; 3];
    for (load, col) in loads.iter_mut().zip(&cols) {
        *load = col.parse().context("failed to parse loadavg")?;
    }

    Ok(loads)
}

fn parse_stat_line(line: &str) -> Result<CpuTimes> {
    // 0:cpu 1:user 2:nice 3:system 4:idle 5:iowait 6:irq 7:softirq
    let cols: Vec<&str> = line.split_ascii_whitespace().collect();
    if cols.len() < 8 || cols[0] != "cpu" {
        return Err(anyhow!("failed to parse stat"));
    }

    let ticks = cols[1..8].iter().map(|col| col.parse().unwrap_or(0));
    let ticks: Vec<u64> = ticks.collect();

    Ok(CpuTimes {
        idle_ticks: ticks[3] + ticks[4],
        total_ticks: ticks.iter().sum(),
    })
}

fn parse_net_dev_line(line: &str) -> Result<NetDev> {
    // name: 0:rx_bytes 1:rx_packets 2:rx_errs 3:rx_drop 4:rx_fifo 5:rx_frame
    // 6:rx_compressed 7:rx_multicast 8:tx_bytes 9:tx_packets ...
    let (name, data) = line
        .split_once(':')
        .ok_or_else(|| anyhow!("failed to parse net/dev"))?;
    let cols: Vec<&str> = data.split_ascii_whitespace().collect();
    if cols.len() < 10 {
        return Err(anyhow!("failed to parse net/dev"));
    }

    let [rx_bytes, rx_packets, tx_bytes, tx_packets] =
        [cols[0], cols[1], cols[8], cols[9]].map(|col| col.parse().unwrap_or(0));

    Ok(NetDev {
        name: name.trim().to_string(),
        rx_bytes,
        rx_packets,
        tx_bytes,
        tx_packets,
    })
}

fn parse_arp_line(line: &str) -> Result<ArpEntry> {
    // 0:ip 1:hw_type 2:flags 3:hw_addr 4:mask 5:device
    let cols: Vec<&str> = line.split_ascii_whitespace().collect();
    if cols.len() < 6 {
        return Err(anyhow!("failed to parse arp"));
    }

    Ok(ArpEntry {
        ip: cols[0].to_string(),
        flags: cols[2].to_string(),
        mac: cols[3].to_ascii_lowercase(),
        device: cols[5].to_string(),
    })
}

pub(super) struct NetDevIter {
    reader: io::BufReader<fs::File>,
}

impl Iterator for NetDevIter {
    type Item = Result<NetDev>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(err) => return Some(Err(err).context("failed to read net/dev")),
            };

            // skip the two header lines
            if !line.contains(':') {
                continue;
            }

            return Some(parse_net_dev_line(&line));
        }
    }
}

pub(super) struct ArpIter {
    reader: io::BufReader<fs::File>,
}

impl Iterator for ArpIter {
    type Item = Result<ArpEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(err) => return Some(Err(err).context("failed to read arp")),
            };

            if line.starts_with("IP address") || line.trim().is_empty() {
                continue;
            }

            return Some(parse_arp_line(&line));
        }
    }
}

impl super::Linux {
    fn procfs_read_string(&self, file: &str) -> Result<String> {
        let mut reader = self.procfs_open(file)?;
        let mut s = String::new();
        reader
            .read_to_string(&mut s)
            .with_context(|| format!("failed to read {file}"))?;
        Ok(s)
    }

    pub(super) fn parse_uptime(&self) -> Result<f64> {
        parse_uptime(&self.procfs_read_string("uptime")?)
    }

    pub(super) fn parse_loadavg(&self) -> Result<[f64; 3]> {
        parse_loadavg(&self.procfs_read_string("loadavg")?)
    }

    pub(super) fn parse_stat(&self) -> Result<CpuTimes> {
        let mut reader = self.procfs_open("stat")?;

        let mut line = String::new();
        reader.read_line(&mut line).context("failed to read stat")?;

        parse_stat_line(&line)
    }

    pub(super) fn parse_meminfo(&self) -> Result<MemInfo> {
        let reader = self.procfs_open("meminfo")?;

        let mut mem_total_kb = 0;
        let mut mem_avail_kb = 0;
        for line in reader.lines() {
            let line = line.context("failed to read meminfo")?;

            // type: value [unit]
            let cols: Vec<&str> = line.split_ascii_whitespace().collect();
            if cols.len() < 2 {
                return Err(anyhow!("failed to parse meminfo"));
            }
            let ty = cols[0];
            let val: u64 = cols[1].parse().unwrap_or(0);

            match ty {
                "MemTotal:" => mem_total_kb = val,
                "MemAvailable:" => {
                    mem_avail_kb = val;
                    // MemAvailable comes after MemTotal
                    break;
                }
                _ => (),
            }
        }

        Ok(MemInfo {
            mem_total_kb,
            mem_avail_kb,
        })
    }

    pub(super) fn parse_net_dev(&self) -> Result<NetDevIter> {
        let reader = self.procfs_open("net/dev")?;
        Ok(NetDevIter { reader })
    }

    pub(super) fn parse_net_arp(&self) -> Result<ArpIter> {
        let reader = self.procfs_open("net/arp")?;
        Ok(ArpIter { reader })
    }
}
