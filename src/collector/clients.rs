// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

//! Connected client discovery.
//!
//! Clients are fused from three sources: the kernel ARP table (MAC and
//! liveness), the network metrics exporter in the time-series store (hostname,
//! device type, online status) and the DHCP lease file (hostname fallback).

use super::{
    kea,
    linux::{ArpEntry, Linux},
};
use crate::{
    cache::{Clock, SystemClock},
    format,
    tsdb::TimeSeries,
};
use anyhow::Result;
use log::{debug, error, warn};
use serde::Serialize;
use std::{
    cmp,
    collections::{BTreeMap, HashMap, HashSet},
    path, sync, time,
};

const QUERY_STATUS: &str = "client_status";
const QUERY_CONNECTIONS: &str = "client_active_connections";
const QUERY_BANDWIDTH: &str = "client_traffic_rate_bps";

const DIRECTORY_TTL: time::Duration = time::Duration::from_secs(30);

/// Clients shown on the dashboard.
pub const MAX_CLIENTS: usize = 20;

#[derive(Clone, Debug, PartialEq)]
pub struct ExporterClient {
    pub hostname: String,
    pub device_type: String,
    pub online: bool,
    pub connections: Option<u64>,
}

/// Exporter clients keyed by IP.
pub type Directory = BTreeMap<String, ExporterClient>;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bandwidth {
    pub rx_bps: f64,
    pub tx_bps: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Reachable,
    Stale,
    Failed,
    Unknown,
}

impl State {
    /// Derives liveness from `/proc/net/arp` flags.
    fn from_arp_flags(flags: &str) -> Self {
        // ATF_COM, ATF_COM | ATF_PERM
        match u32::from_str_radix(flags.trim_start_matches("0x"), 16) {
            Ok(0x2) | Ok(0x6) => State::Reachable,
            Ok(_) => State::Stale,
            Err(_) => State::Unknown,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            State::Reachable => 0,
            State::Stale => 1,
            State::Unknown => 2,
            State::Failed => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Arp,
    Exporter,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientRecord {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
    pub device_type: String,
    pub icon: &'static str,
    pub source: Source,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<u64>,
    pub bandwidth_rx_bps: f64,
    pub bandwidth_tx_bps: f64,
    pub bandwidth_rx_formatted: String,
    pub bandwidth_tx_formatted: String,
}

impl ClientRecord {
    fn total_bps(&self) -> f64 {
        self.bandwidth_rx_bps + self.bandwidth_tx_bps
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientList {
    pub count: usize,
    pub clients: Vec<ClientRecord>,
    #[serde(rename = "_debug_timing")]
    pub debug_timing: f64,
}

/// Maps a device type to its dashboard icon class.
pub fn device_icon(device_type: &str) -> &'static str {
    match device_type {
        "phone" | "generic" => "lni-mobile",
        "tablet" => "lni-tab",
        "laptop" => "lni-laptop",
        "computer" | "desktop" => "lni-display-alt",
        "media" | "tv" => "lni-display",
        "gaming" | "game-console" => "lni-game",
        "iot" | "smart-speaker" => "lni-volume-high",
        "printer" => "lni-printer",
        "server" => "lni-server",
        "network" | "router" => "lni-network",
        "camera" => "lni-camera",
        "watch" => "lni-timer",
        "unknown" => "lni-help",
        _ => "lni-mobile",
    }
}

/// The inputs of one fusion pass.
pub struct Sources<'a> {
    pub arp: &'a [ArpEntry],
    pub exporter: &'a Directory,
    pub leases: &'a HashMap<String, String>,
    pub bandwidth: &'a HashMap<String, Bandwidth>,
}

struct Identity<'a> {
    hostname: &'a str,
    device_type: &'a str,
    connections: Option<u64>,
}

impl<'a> From<&'a ExporterClient> for Identity<'a> {
    fn from(client: &'a ExporterClient) -> Self {
        Identity {
            hostname: &client.hostname,
            device_type: &client.device_type,
            connections: client.connections,
        }
    }
}

fn record(
    ip: &str,
    mac: &str,
    id: Identity,
    source: Source,
    state: State,
    bw: Bandwidth,
) -> ClientRecord {
    ClientRecord {
        ip: ip.to_string(),
        mac: mac.to_string(),
        hostname: id.hostname.to_string(),
        device_type: id.device_type.to_string(),
        icon: device_icon(id.device_type),
        source,
        state,
        connections: id.connections,
        bandwidth_rx_bps: bw.rx_bps,
        bandwidth_tx_bps: bw.tx_bps,
        bandwidth_rx_formatted: format::format_bandwidth(bw.rx_bps),
        bandwidth_tx_formatted: format::format_bandwidth(bw.tx_bps),
    }
}

/// Merges the sources into one client per IP.
///
/// ARP entries come first in table order, followed by exporter-only clients
/// in IP order. ARP presence is required for `reachable` or `stale`; the
/// exporter can only downgrade an ARP client to `failed`.
pub fn fuse(src: &Sources) -> Vec<ClientRecord> {
    let mut clients = Vec::new();
    let mut seen = HashSet::new();

    for entry in src.arp {
        if !seen.insert(entry.ip.as_str()) {
            continue;
        }

        let bw = src.bandwidth.get(&entry.ip).copied().unwrap_or_default();
        let mut state = State::from_arp_flags(&entry.flags);

        let id = match src.exporter.get(&entry.ip) {
            Some(client) => {
                if !client.online {
                    state = State::Failed;
                }
                Identity::from(client)
            }
            None => Identity {
                hostname: src.leases.get(&entry.ip).unwrap_or(&entry.ip),
                device_type: "unknown",
                connections: None,
            },
        };

        clients.push(record(&entry.ip, &entry.mac, id, Source::Arp, state, bw));
    }

    for (ip, client) in src.exporter {
        if seen.contains(ip.as_str()) {
            continue;
        }

        let state = if client.online {
            State::Stale
        } else {
            State::Failed
        };
        let bw = src.bandwidth.get(ip).copied().unwrap_or_default();
        clients.push(record(
            ip,
            "unknown",
            Identity::from(client),
            Source::Exporter,
            state,
            bw,
        ));
    }

    clients
}

/// Orders clients for display and keeps the first `MAX_CLIENTS`.
pub fn rank(mut clients: Vec<ClientRecord>) -> Vec<ClientRecord> {
    clients.sort_by(|a, b| {
        a.state.rank().cmp(&b.state.rank()).then_with(|| {
            b.total_bps()
                .partial_cmp(&a.total_bps())
                .unwrap_or(cmp::Ordering::Equal)
        })
    });
    clients.truncate(MAX_CLIENTS);

    clients
}

async fn fetch_directory(tsdb: &dyn TimeSeries) -> Result<Directory> {
    let (status, connections) =
        tokio::join!(tsdb.query(QUERY_STATUS), tsdb.query(QUERY_CONNECTIONS));

    let mut dir = Directory::new();
    for sample in status? {
        let Some(ip) = sample.label("ip").filter(|ip| !ip.is_empty()) else {
            continue;
        };

        dir.insert(
            ip.to_string(),
            ExporterClient {
                hostname: sample.label("client").unwrap_or("unknown").to_string(),
                device_type: sample.label("device_type").unwrap_or("unknown").to_string(),
                online: sample.value > 0.0,
                connections: None,
            },
        );
    }

    match connections {
        Ok(connections) => {
            for sample in connections {
                if let Some(client) = sample.label("ip").and_then(|ip| dir.get_mut(ip)) {
                    client.connections = Some(sample.value as u64);
                }
            }
        }
        Err(err) => debug!("failed to query client connections: {err:?}"),
    }

    Ok(dir)
}

/// Exporter client info with a TTL.
///
/// A failed refresh keeps serving the previous directory. The lock is only
/// held to read or swap the directory, never across the query.
pub struct ClientDirectory {
    tsdb: sync::Arc<dyn TimeSeries>,
    ttl: time::Duration,
    clock: sync::Arc<dyn Clock>,
    current: sync::Mutex<Option<(time::Instant, sync::Arc<Directory>)>>,
}

impl ClientDirectory {
    pub fn new(tsdb: sync::Arc<dyn TimeSeries>) -> Self {
        Self::with_clock(tsdb, DIRECTORY_TTL, sync::Arc::new(SystemClock))
    }

    pub fn with_clock(
        tsdb: sync::Arc<dyn TimeSeries>,
        ttl: time::Duration,
        clock: sync::Arc<dyn Clock>,
    ) -> Self {
        ClientDirectory {
            tsdb,
            ttl,
            clock,
            current: sync::Mutex::new(None),
        }
    }

    pub async fn get(&self) -> sync::Arc<Directory> {
        let now = self.clock.now();
        let current = self.current.lock().unwrap().clone();
        if let Some((updated, dir)) = &current {
            if now.duration_since(*updated) < self.ttl {
                return dir.clone();
            }
        }

        match fetch_directory(&*self.tsdb).await {
            Ok(dir) => {
                let dir = sync::Arc::new(dir);
                *self.current.lock().unwrap() = Some((now, dir.clone()));
                dir
            }
            Err(err) => {
                warn!("failed to refresh client info: {err:?}");
                current.map(|(_, dir)| dir).unwrap_or_default()
            }
        }
    }
}

async fn bandwidth_rates(tsdb: &dyn TimeSeries) -> Result<HashMap<String, Bandwidth>> {
    let mut rates: HashMap<String, Bandwidth> = HashMap::new();

    for sample in tsdb.query(QUERY_BANDWIDTH).await? {
        let Some(ip) = sample.label("ip") else {
            continue;
        };

        let bw = rates.entry(ip.to_string()).or_default();
        match sample.label("direction") {
            Some("rx") => bw.rx_bps = sample.value,
            Some("tx") => bw.tx_bps = sample.value,
            _ => (),
        }
    }

    Ok(rates)
}

/// Collects the connected client list.
pub struct Clients {
    lan_dev: String,
    leases_path: path::PathBuf,
    tsdb: sync::Arc<dyn TimeSeries>,
    directory: ClientDirectory,
}

impl Clients {
    pub fn new(
        lan_dev: &str,
        leases_path: impl Into<path::PathBuf>,
        tsdb: sync::Arc<dyn TimeSeries>,
    ) -> Self {
        Clients {
            lan_dev: lan_dev.to_string(),
            leases_path: leases_path.into(),
            directory: ClientDirectory::new(tsdb.clone()),
            tsdb,
        }
    }

    pub async fn collect(&self, lin: &Linux) -> ClientList {
        let start = time::Instant::now();

        let (bandwidth, exporter, leases) = tokio::join!(
            bandwidth_rates(&*self.tsdb),
            self.directory.get(),
            kea::read_leases(&self.leases_path),
        );

        let bandwidth = bandwidth.unwrap_or_else(|err| {
            error!("failed to get client bandwidth: {err:?}");
            HashMap::new()
        });
        let leases = leases.unwrap_or_else(|err| {
            debug!("no dhcp leases: {err:?}");
            HashMap::new()
        });
        let arp = lin.arp_table(&self.lan_dev).unwrap_or_else(|err| {
            error!("failed to read arp table: {err:?}");
            Vec::new()
        });

        let clients = fuse(&Sources {
            arp: &arp,
            exporter: &exporter,
            leases: &leases,
            bandwidth: &bandwidth,
        });

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed > 100.0 {
            debug!("collecting clients took {elapsed:.1}ms");
        }

        ClientList {
            count: clients.len(),
            clients: rank(clients),
            debug_timing: format::round1(elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::collector::linux;
    use crate::tsdb::fake::{FakeTsdb, sample};

    fn arp(ip: &str, mac: &str, flags: &str) -> ArpEntry {
        ArpEntry {
            ip: ip.to_string(),
            flags: flags.to_string(),
            mac: mac.to_string(),
            device: "br-lan".to_string(),
        }
    }

    fn exporter(hostname: &str, device_type: &str, online: bool) -> ExporterClient {
        ExporterClient {
            hostname: hostname.to_string(),
            device_type: device_type.to_string(),
            online,
            connections: None,
        }
    }

    #[test]
    fn arp_flags() {
        assert_eq!(State::from_arp_flags("0x2"), State::Reachable);
        assert_eq!(State::from_arp_flags("0x6"), State::Reachable);
        assert_eq!(State::from_arp_flags("0x4"), State::Stale);
        assert_eq!(State::from_arp_flags("garbage"), State::Unknown);
    }

    #[derive(Default)]
    struct Fixture {
        arp: Vec<ArpEntry>,
        exporter: Directory,
        leases: HashMap<String, String>,
        bandwidth: HashMap<String, Bandwidth>,
    }

    impl Fixture {
        fn fuse(&self) -> Vec<ClientRecord> {
            fuse(&Sources {
                arp: &self.arp,
                exporter: &self.exporter,
                leases: &self.leases,
                bandwidth: &self.bandwidth,
            })
        }
    }

    #[test]
    fn exporter_enriches_arp_entry() {
        let mut fix = Fixture {
            arp: vec![arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2")],
            ..Default::default()
        };
        fix.exporter
            .insert("10.1.1.5".to_string(), exporter("laptop", "laptop", true));

        let clients = fix.fuse();
        assert_eq!(clients.len(), 1);
        let client = &clients[0];
        assert_eq!(client.ip, "10.1.1.5");
        assert_eq!(client.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(client.hostname, "laptop");
        assert_eq!(client.device_type, "laptop");
        assert_eq!(client.icon, "lni-laptop");
        assert_eq!(client.state, State::Reachable);
        assert_eq!(client.source, Source::Arp);
    }

    #[test]
    fn ip_is_the_dedup_key() {
        let mut fix = Fixture {
            arp: vec![
                arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2"),
                arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2"),
                arp("10.1.1.6", "aa:bb:cc:dd:ee:ff", "0x2"),
            ],
            ..Default::default()
        };
        fix.exporter
            .insert("10.1.1.5".to_string(), exporter("laptop", "laptop", true));
        fix.exporter
            .insert("10.1.1.9".to_string(), exporter("phone", "phone", true));

        let clients = fix.fuse();
        let ips: Vec<&str> = clients.iter().map(|c| c.ip.as_str()).collect();
        assert_eq!(ips, ["10.1.1.5", "10.1.1.6", "10.1.1.9"]);
    }

    #[test]
    fn fallbacks_without_exporter() {
        let mut fix = Fixture {
            arp: vec![
                arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2"),
                arp("10.1.1.6", "11:22:33:44:55:66", "0x2"),
            ],
            ..Default::default()
        };
        fix.leases
            .insert("10.1.1.6".to_string(), "printer".to_string());

        let clients = fix.fuse();
        assert_eq!(clients[0].hostname, "10.1.1.5");
        assert_eq!(clients[0].device_type, "unknown");
        assert_eq!(clients[0].icon, "lni-help");
        assert_eq!(clients[1].hostname, "printer");
    }

    #[test]
    fn exporter_offline_downgrades_only() {
        let mut fix = Fixture {
            arp: vec![
                arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2"),
                arp("10.1.1.6", "11:22:33:44:55:66", "0x4"),
            ],
            ..Default::default()
        };
        fix.exporter
            .insert("10.1.1.5".to_string(), exporter("tv", "tv", false));
        fix.exporter
            .insert("10.1.1.6".to_string(), exporter("nas", "server", true));
        fix.exporter
            .insert("10.1.1.7".to_string(), exporter("watch", "watch", true));
        fix.exporter
            .insert("10.1.1.8".to_string(), exporter("console", "gaming", false));

        let clients = fix.fuse();
        let states: Vec<State> = clients.iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            [State::Failed, State::Stale, State::Stale, State::Failed]
        );
        assert_eq!(clients[2].mac, "unknown");
        assert_eq!(clients[2].source, Source::Exporter);
    }

    #[test]
    fn bandwidth_attached_by_ip() {
        let mut fix = Fixture {
            arp: vec![arp("10.1.1.5", "aa:bb:cc:dd:ee:ff", "0x2")],
            ..Default::default()
        };
        fix.bandwidth.insert(
            "10.1.1.5".to_string(),
            Bandwidth {
                rx_bps: 2_500_000.0,
                tx_bps: 800.0,
            },
        );

        let clients = fix.fuse();
        assert_eq!(clients[0].bandwidth_rx_bps, 2_500_000.0);
        assert_eq!(clients[0].bandwidth_rx_formatted, "2.5 Mbps");
        assert_eq!(clients[0].bandwidth_tx_formatted, "800 bps");
    }

    #[test]
    fn empty_arp_still_lists_exporter_clients() {
        let mut fix = Fixture::default();
        fix.exporter
            .insert("10.1.1.9".to_string(), exporter("phone", "phone", true));

        let clients = fix.fuse();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].state, State::Stale);
    }

    #[test]
    fn rank_orders_and_truncates() {
        let mut fix = Fixture {
            arp: (0..25)
                .map(|i| arp(&format!("10.1.1.{i}"), "aa:bb:cc:dd:ee:ff", "0x2"))
                .collect(),
            ..Default::default()
        };
        fix.bandwidth.insert(
            "10.1.1.24".to_string(),
            Bandwidth {
                rx_bps: 100.0,
                tx_bps: 0.0,
            },
        );
        fix.exporter
            .insert("10.1.1.0".to_string(), exporter("gone", "phone", false));

        let clients = rank(fix.fuse());
        assert_eq!(clients.len(), MAX_CLIENTS);
        assert_eq!(clients[0].ip, "10.1.1.24");
        assert_eq!(clients[1].ip, "10.1.1.1");
        assert!(clients.iter().all(|c| c.state == State::Reachable));
    }

    fn directory_tsdb() -> FakeTsdb {
        FakeTsdb::default()
            .with(
                QUERY_STATUS,
                vec![
                    sample(
                        &[("ip", "10.1.1.5"), ("client", "laptop"), ("device_type", "laptop")],
                        1.0,
                    ),
                    sample(&[("client", "no-ip")], 1.0),
                    sample(&[("ip", "10.1.1.9"), ("client", "phone")], 0.0),
                ],
            )
            .with(
                QUERY_CONNECTIONS,
                vec![
                    sample(&[("ip", "10.1.1.5")], 12.0),
                    sample(&[("ip", "10.1.1.77")], 3.0),
                ],
            )
    }

    #[tokio::test]
    async fn directory_from_exporter() {
        let dir = fetch_directory(&directory_tsdb()).await.unwrap();

        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir["10.1.1.5"],
            ExporterClient {
                hostname: "laptop".to_string(),
                device_type: "laptop".to_string(),
                online: true,
                connections: Some(12),
            }
        );
        assert!(!dir["10.1.1.9"].online);
        assert_eq!(dir["10.1.1.9"].device_type, "unknown");
    }

    #[tokio::test]
    async fn directory_is_cached() {
        let tsdb = sync::Arc::new(directory_tsdb());
        let clock = ManualClock::new();
        let dir = ClientDirectory::with_clock(tsdb.clone(), DIRECTORY_TTL, clock.clone());

        assert_eq!(dir.get().await.len(), 2);
        assert_eq!(dir.get().await.len(), 2);
        assert_eq!(tsdb.query_count(), 2);

        clock.advance(DIRECTORY_TTL);
        dir.get().await;
        assert_eq!(tsdb.query_count(), 4);
    }

    #[tokio::test]
    async fn directory_serves_stale_on_error() {
        let tsdb = sync::Arc::new(FakeTsdb {
            fail: true,
            ..Default::default()
        });
        let clock = ManualClock::new();
        let dir = ClientDirectory::with_clock(tsdb, DIRECTORY_TTL, clock.clone());
        assert!(dir.get().await.is_empty());

        let mut known = Directory::new();
        known.insert("10.1.1.5".to_string(), exporter("laptop", "laptop", true));
        *dir.current.lock().unwrap() = Some((clock.now(), sync::Arc::new(known)));

        clock.advance(DIRECTORY_TTL * 2);
        assert_eq!(dir.get().await.len(), 1);
    }

    #[tokio::test]
    async fn collect_from_all_sources() {
        let procfs = linux::tests::fake_procfs(
            "10.1.1.5         0x1         0x2         aa:bb:cc:dd:ee:ff     *        br-lan\n\
             10.1.1.6         0x1         0x2         11:22:33:44:55:66     *        br-lan\n",
        );
        let lin = Linux::new(procfs.path());

        let leases = procfs.path().join("kea-leases4.csv");
        std::fs::write(&leases, "10.1.1.6,11:22:33:44:55:66,,3600,0,1,0,0,printer,0,,0\n").unwrap();

        let tsdb = directory_tsdb().with(
            QUERY_BANDWIDTH,
            vec![
                sample(&[("ip", "10.1.1.6"), ("direction", "rx")], 5000.0),
                sample(&[("ip", "10.1.1.6"), ("direction", "tx")], 1000.0),
            ],
        );
        let clients = Clients::new("br-lan", &leases, sync::Arc::new(tsdb));

        let list = clients.collect(&lin).await;
        assert_eq!(list.count, 3);

        let ips: Vec<&str> = list.clients.iter().map(|c| c.ip.as_str()).collect();
        assert_eq!(ips, ["10.1.1.6", "10.1.1.5", "10.1.1.9"]);
        assert_eq!(list.clients[0].hostname, "printer");
        assert_eq!(list.clients[1].hostname, "laptop");
        assert_eq!(list.clients[1].connections, Some(12));
        assert_eq!(list.clients[2].state, State::Failed);

        let json = serde_json::to_value(&list).unwrap();
        assert!(json["_debug_timing"].is_number());
        assert_eq!(json["clients"][0]["state"], "reachable");
    }

    #[tokio::test]
    async fn collect_without_any_source() {
        let dir = tempfile::tempdir().unwrap();
        let lin = Linux::new(dir.path());
        let tsdb = FakeTsdb {
            fail: true,
            ..Default::default()
        };
        let clients = Clients::new("br-lan", dir.path().join("leases"), sync::Arc::new(tsdb));

        let list = clients.collect(&lin).await;
        assert_eq!(list.count, 0);
        assert!(list.clients.is_empty());
    }
}
