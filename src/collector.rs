// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

mod blocky;
mod clients;
mod kea;
mod linux;
mod net;
mod ping;

use crate::{
    cache::{Clock, SystemClock, TtlCache},
    config, format, history,
    tsdb::{self, BoxFuture, TimeSeries},
};
use anyhow::Result;
use log::{debug, error, warn};
use serde::Serialize;
use std::{collections::BTreeMap, sync, time};

const AGGREGATE_TTL: time::Duration = time::Duration::from_secs(5);
const CONNECTIVITY_TTL: time::Duration = time::Duration::from_secs(30);
const DNS_TTL: time::Duration = time::Duration::from_secs(10);
const COLLECTOR_TIMEOUT: time::Duration = time::Duration::from_secs(3);

/// Timing reported for a category whose collector failed.
const FAILED_TIMING: f64 = -1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Uptime,
    Cpu,
    Memory,
    Network,
    Clients,
    Connectivity,
    Blocky,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Uptime,
        Category::Cpu,
        Category::Memory,
        Category::Network,
        Category::Clients,
        Category::Connectivity,
        Category::Blocky,
    ];
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Empty {}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Uptime(linux::Uptime),
    Cpu(linux::CpuInfo),
    Memory(linux::MemoryInfo),
    Network(net::NetworkInfo),
    Clients(clients::ClientList),
    Connectivity(ping::Connectivity),
    Blocky(blocky::DnsStats),
    Empty(Empty),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Timings {
    /// Milliseconds.
    pub total: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<Category, f64>,
    pub from_cache: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricSnapshot {
    #[serde(flatten)]
    pub categories: BTreeMap<Category, Payload>,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(rename = "_timings")]
    pub timings: Timings,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("panicked")]
    Panicked,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Something that can produce the payload of any category.
pub trait Collect: Send + Sync + 'static {
    fn collect(&self, cat: Category) -> BoxFuture<'_, Result<Payload, CollectorError>>;
}

fn elapsed_ms(start: time::Instant) -> f64 {
    format::round1(start.elapsed().as_secs_f64() * 1000.0)
}

/// Builds one `MetricSnapshot` by running every category in parallel.
///
/// A category that fails, panics or exceeds the timeout is reported as an
/// empty object with a `-1` timing. Snapshots are cached for a few seconds;
/// concurrent misses may compute redundantly.
pub struct Aggregator<C> {
    collector: sync::Arc<C>,
    timeout: time::Duration,
    cache: TtlCache<(), MetricSnapshot>,
}

impl<C: Collect> Aggregator<C> {
    pub fn new(collector: C) -> Self {
        Self::with_clock(collector, COLLECTOR_TIMEOUT, sync::Arc::new(SystemClock))
    }

    pub fn with_clock(collector: C, timeout: time::Duration, clock: sync::Arc<dyn Clock>) -> Self {
        Aggregator {
            collector: sync::Arc::new(collector),
            timeout,
            cache: TtlCache::with_clock(AGGREGATE_TTL, clock),
        }
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub async fn snapshot(&self) -> MetricSnapshot {
        if let Some(mut snapshot) = self.cache.get(&()) {
            snapshot.timings = Timings {
                from_cache: true,
                ..Default::default()
            };
            return snapshot;
        }

        let start = time::Instant::now();

        let handles: Vec<_> = Category::ALL
            .iter()
            .map(|&cat| {
                let collector = self.collector.clone();
                let timeout = self.timeout;

                let handle = tokio::task::spawn(async move {
                    let start = time::Instant::now();
                    let res = match tokio::time::timeout(timeout, collector.collect(cat)).await {
                        Ok(res) => res,
                        Err(_) => Err(CollectorError::Timeout(timeout)),
                    };
                    (res, elapsed_ms(start))
                });
                (cat, handle)
            })
            .collect();

        let mut categories = BTreeMap::new();
        let mut details = BTreeMap::new();
        for (cat, handle) in handles {
            let res = match handle.await {
                Ok((res, ms)) => res.map(|payload| (payload, ms)),
                Err(err) if err.is_panic() => Err(CollectorError::Panicked),
                Err(err) => Err(CollectorError::Failed(err.into())),
            };

            let (payload, ms) = res.unwrap_or_else(|err| {
                error!("failed to collect {cat:?}: {err:?}");
                (Payload::Empty(Empty {}), FAILED_TIMING)
            });
            categories.insert(cat, payload);
            details.insert(cat, ms);
        }

        let snapshot = MetricSnapshot {
            categories,
            timestamp: chrono::Utc::now().timestamp(),
            timings: Timings::default(),
        };
        self.cache.set((), snapshot.clone());

        let total = elapsed_ms(start);
        if total > 1000.0 {
            warn!("slow metrics collection: {total}ms {details:?}");
        }

        MetricSnapshot {
            timings: Timings {
                total,
                details,
                from_cache: false,
            },
            ..snapshot
        }
    }
}

/// Collects the dashboard categories from the host and the time-series store.
pub struct Collector {
    lin: linux::Linux,
    net: net::Net,
    clients: clients::Clients,
    histories: history::Histories,
    tsdb: sync::Arc<dyn TimeSeries>,

    connectivity: TtlCache<(), ping::Connectivity>,
    dns: TtlCache<(), blocky::DnsStats>,
}

impl Collector {
    pub fn new(config: &config::Config) -> Result<Self> {
        debug!("creating collector");

        let tsdb = tsdb::VictoriaMetrics::new(&config.vm_url)?;

        Self::with_tsdb(
            config.procfs_path,
            &config.lan_dev,
            &config.kea_leases,
            sync::Arc::new(tsdb),
        )
    }

    fn with_tsdb(
        procfs_path: &std::path::Path,
        lan_dev: &str,
        kea_leases: &std::path::Path,
        tsdb: sync::Arc<dyn TimeSeries>,
    ) -> Result<Self> {
        Ok(Collector {
            lin: linux::Linux::new(procfs_path),
            net: net::Net::new(lan_dev)?,
            clients: clients::Clients::new(lan_dev, kea_leases, tsdb.clone()),
            histories: history::Histories::new(tsdb.clone()),
            tsdb,
            connectivity: TtlCache::new(CONNECTIVITY_TTL),
            dns: TtlCache::new(DNS_TTL),
        })
    }

    fn interfaces(&self) -> BTreeMap<String, linux::InterfaceStats> {
        self.lin.interface_stats().unwrap_or_else(|err| {
            error!("failed to read interface stats: {err:?}");
            BTreeMap::new()
        })
    }

    async fn network(&self) -> net::NetworkInfo {
        let (wan_ip, lan_network) = tokio::join!(self.net.wan_ip(), self.net.lan_network());

        net::NetworkInfo {
            wan_ip,
            lan_network,
            interfaces: self.interfaces(),
        }
    }

    async fn connectivity(&self) -> ping::Connectivity {
        if let Some(conn) = self.connectivity.get(&()) {
            return conn;
        }

        let conn = ping::check_connectivity().await;
        self.connectivity.set((), conn.clone());
        conn
    }

    async fn dns_stats(&self) -> blocky::DnsStats {
        if let Some(stats) = self.dns.get(&()) {
            return stats;
        }

        let stats = blocky::dns_stats(&*self.tsdb).await;
        self.dns.set((), stats.clone());
        stats
    }

    /// Returns bandwidth histories of `ips`, or of the listed clients when
    /// `ips` is `None`.
    pub async fn client_histories(
        &self,
        ips: Option<Vec<String>>,
        duration: &str,
    ) -> Result<sync::Arc<history::HistoryMap>> {
        let ips = match ips {
            Some(ips) => ips,
            None => self
                .clients
                .collect(&self.lin)
                .await
                .clients
                .into_iter()
                .map(|client| client.ip)
                .collect(),
        };

        self.histories.get(&ips, duration).await
    }
}

impl Collect for Collector {
    fn collect(&self, cat: Category) -> BoxFuture<'_, Result<Payload, CollectorError>> {
        Box::pin(async move {
            let payload = match cat {
                Category::Uptime => Payload::Uptime(self.lin.uptime()?),
                Category::Cpu => Payload::Cpu(self.lin.cpu()?),
                Category::Memory => Payload::Memory(self.lin.memory()?),
                Category::Network => Payload::Network(self.network().await),
                Category::Clients => Payload::Clients(self.clients.collect(&self.lin).await),
                Category::Connectivity => Payload::Connectivity(self.connectivity().await),
                Category::Blocky => Payload::Blocky(self.dns_stats().await),
            };

            Ok(payload)
        })
    }
}
