// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use super::linux::InterfaceStats;
use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::Serialize;
use std::{collections::BTreeMap, net, time};

const IP_TIMEOUT: time::Duration = time::Duration::from_secs(1);
const LOOKUP_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// PPPoE link; any address on it is public.
const WAN_PPP: &str = "ppp0";
/// Probed in order when there is no PPPoE link.
const WAN_INTERFACES: [&str; 4] = ["enp2s0", "eth0", "wan", "enp1s0"];
const WAN_LOOKUP_URL: &str = "https://ifconfig.me";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LanNetwork {
    pub ip: String,
    pub cidr: String,
    pub prefix_length: u8,
}

impl Default for LanNetwork {
    fn default() -> Self {
        LanNetwork {
            ip: "10.1.1.1".to_string(),
            cidr: "10.1.1.0/24".to_string(),
            prefix_length: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NetworkInfo {
    pub wan_ip: String,
    pub lan_network: LanNetwork,
    pub interfaces: BTreeMap<String, InterfaceStats>,
}

/// Returns the `inet` addresses in `ip -4 addr show` output.
fn parse_inet_addrs(out: &str) -> Vec<(net::Ipv4Addr, u8)> {
    out.lines()
        .filter_map(|line| {
            let mut cols = line.split_ascii_whitespace();
            if cols.next() != Some("inet") {
                return None;
            }

            let (addr, prefix) = cols.next()?.split_once('/')?;
            Some((addr.parse().ok()?, prefix.parse().ok()?))
        })
        .collect()
}

fn is_public(addr: &net::Ipv4Addr) -> bool {
    !addr.is_private() && !addr.is_loopback() && !addr.is_link_local()
}

/// Looks up addresses through the `ip` command.
pub struct Net {
    lan_dev: String,
    http: reqwest::Client,
}

impl Net {
    pub fn new(lan_dev: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .context("failed to build http client")?;

        Ok(Net {
            lan_dev: lan_dev.to_string(),
            http,
        })
    }

    async fn ip_addr_show(&self, dev: &str) -> Result<Vec<(net::Ipv4Addr, u8)>> {
        let cmd = tokio::process::Command::new("ip")
            .args(["-4", "addr", "show", dev])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(IP_TIMEOUT, cmd)
            .await
            .map_err(|_| anyhow!("ip addr show {dev} timed out"))?
            .context("failed to run ip")?;
        if !output.status.success() {
            return Err(anyhow!("ip addr show {dev} exited with {}", output.status));
        }

        Ok(parse_inet_addrs(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn lookup_wan_ip(&self) -> Result<net::Ipv4Addr> {
        let body = self
            .http
            .get(WAN_LOOKUP_URL)
            .send()
            .await
            .with_context(|| format!("failed to request {WAN_LOOKUP_URL}"))?
            .text()
            .await
            .context("failed to read wan ip lookup")?;

        body.trim()
            .parse()
            .with_context(|| format!("invalid wan ip {:?}", body.trim()))
    }

    pub async fn wan_ip(&self) -> String {
        match self.ip_addr_show(WAN_PPP).await {
            Ok(addrs) => {
                if let Some((addr, _)) = addrs.first() {
                    return addr.to_string();
                }
            }
            Err(err) => debug!("no pppoe address: {err:?}"),
        }

        for dev in WAN_INTERFACES {
            match self.ip_addr_show(dev).await {
                Ok(addrs) => {
                    if let Some((addr, _)) = addrs.iter().find(|(addr, _)| is_public(addr)) {
                        return addr.to_string();
                    }
                }
                Err(err) => debug!("no wan address on {dev}: {err:?}"),
            }
        }

        match self.lookup_wan_ip().await {
            Ok(addr) => addr.to_string(),
            Err(err) => {
                debug!("wan ip lookup failed: {err:?}");
                "unknown".to_string()
            }
        }
    }

    pub async fn lan_network(&self) -> LanNetwork {
        match self.ip_addr_show(&self.lan_dev).await {
            Ok(addrs) => {
                if let Some((addr, prefix)) = addrs.first() {
                    return LanNetwork {
                        ip: addr.to_string(),
                        cidr: format!("{addr}/{prefix}"),
                        prefix_length: *prefix,
                    };
                }
            }
            Err(err) => debug!("no lan address on {}: {err:?}", self.lan_dev),
        }

        LanNetwork::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR_OUTPUT: &str = "\
3: enp2s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    inet 192.168.1.20/24 brd 192.168.1.255 scope global dynamic enp2s0
       valid_lft 85902sec preferred_lft 85902sec
    inet 203.0.113.7/22 brd 203.0.115.255 scope global enp2s0
       valid_lft forever preferred_lft forever
";

    #[test]
    fn inet_lines() {
        let addrs = parse_inet_addrs(IP_ADDR_OUTPUT);
        assert_eq!(
            addrs,
            [
                (net::Ipv4Addr::new(192, 168, 1, 20), 24),
                (net::Ipv4Addr::new(203, 0, 113, 7), 22),
            ]
        );
        assert!(parse_inet_addrs("Device \"wan\" does not exist.\n").is_empty());
    }

    #[test]
    fn private_ranges_are_skipped() {
        let public: Vec<_> = parse_inet_addrs(IP_ADDR_OUTPUT)
            .into_iter()
            .filter(|(addr, _)| is_public(addr))
            .collect();
        assert_eq!(public, [(net::Ipv4Addr::new(203, 0, 113, 7), 22)]);

        assert!(!is_public(&net::Ipv4Addr::new(10, 1, 1, 1)));
        assert!(!is_public(&net::Ipv4Addr::new(172, 20, 0, 1)));
    }

    #[test]
    fn lan_fallback() {
        let lan = LanNetwork::default();
        assert_eq!(lan.cidr, "10.1.1.0/24");
        assert_eq!(lan.prefix_length, 24);
    }
}
