// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use crate::format;
use crate::tsdb::{self, Sample, TimeSeries};
use anyhow::Result;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

const QUERY_TOTAL: &str = "sum(blocky_query_total)";
const QUERY_BLOCKED: &str = r#"sum(blocky_response_total{response_type="BLOCKED"})"#;
const QUERY_PER_MINUTE: &str = "sum(rate(blocky_query_total[5m])) * 60";
const QUERY_CACHE_HITS: &str = "sum(blocky_cache_hits_total)";
const QUERY_CACHE_MISSES: &str = "sum(blocky_cache_misses_total)";
const QUERY_TOP_CLIENTS: &str = "topk(5, sum by (client) (blocky_query_total))";
const QUERY_BLOCK_REASONS: &str =
    r#"sum by (reason) (blocky_response_total{response_type="BLOCKED"})"#;

const TOP_CLIENTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopClient {
    pub ip: String,
    pub hostname: String,
    pub queries: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DnsStats {
    pub enabled: bool,
    pub total_queries: u64,
    pub blocked_queries: u64,
    pub block_percentage: f64,
    pub queries_per_minute: f64,
    pub cache_hit_rate: f64,
    pub top_clients: Vec<TopClient>,
    /// Blocky does not export per-domain counters, so this is always empty.
    pub top_blocked_domains: Vec<String>,
    pub blocking_lists: BTreeMap<String, u64>,
}

/// Extracts `name` from a `BLOCKED (name)` reason.
fn blocking_list(reason: &str) -> Option<&str> {
    if !reason.contains("BLOCKED") {
        return None;
    }

    let (_, rest) = reason.split_once('(')?;
    let (name, _) = rest.split_once(')')?;
    Some(name)
}

fn percentage(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        format::round1(part / total * 100.0)
    } else {
        0.0
    }
}

fn ok_or_empty(res: Result<Vec<Sample>>, expr: &str) -> Vec<Sample> {
    res.unwrap_or_else(|err| {
        debug!("blocky query {expr} failed: {err:?}");
        Vec::new()
    })
}

/// Queries Blocky statistics from the time-series store.
///
/// Missing total queries means Blocky is not running or not scraped, which is
/// reported as disabled rather than as an error.
pub async fn dns_stats(tsdb: &dyn TimeSeries) -> DnsStats {
    let (total, blocked, per_minute, hits, misses, top_clients, reasons) = tokio::join!(
        tsdb.query(QUERY_TOTAL),
        tsdb.query(QUERY_BLOCKED),
        tsdb.query(QUERY_PER_MINUTE),
        tsdb.query(QUERY_CACHE_HITS),
        tsdb.query(QUERY_CACHE_MISSES),
        tsdb.query(QUERY_TOP_CLIENTS),
        tsdb.query(QUERY_BLOCK_REASONS),
    );

    let Some(total) = tsdb::first_value(&ok_or_empty(total, QUERY_TOTAL)) else {
        return DnsStats::default();
    };
    let total_queries = total as u64;
    let blocked_queries =
        tsdb::first_value(&ok_or_empty(blocked, QUERY_BLOCKED)).unwrap_or(0.0) as u64;
    let queries_per_minute = tsdb::first_value(&ok_or_empty(per_minute, QUERY_PER_MINUTE))
        .map_or(0.0, format::round1);

    let hits = tsdb::first_value(&ok_or_empty(hits, QUERY_CACHE_HITS));
    let misses = tsdb::first_value(&ok_or_empty(misses, QUERY_CACHE_MISSES));
    let cache_hit_rate = match (hits, misses) {
        (Some(hits), Some(misses)) => percentage(hits, hits + misses),
        _ => 0.0,
    };

    let top_clients = ok_or_empty(top_clients, QUERY_TOP_CLIENTS)
        .iter()
        .take(TOP_CLIENTS)
        .map(|sample| {
            let ip = sample.label("client").unwrap_or("unknown").to_string();
            TopClient {
                hostname: ip.clone(),
                ip,
                queries: sample.value as u64,
            }
        })
        .collect();

    let blocking_lists = ok_or_empty(reasons, QUERY_BLOCK_REASONS)
        .iter()
        .filter_map(|sample| {
            let name = blocking_list(sample.label("reason")?)?;
            Some((name.to_string(), sample.value as u64))
        })
        .collect();

    DnsStats {
        enabled: true,
        total_queries,
        blocked_queries,
        block_percentage: percentage(blocked_queries as f64, total_queries as f64),
        queries_per_minute,
        cache_hit_rate,
        top_clients,
        top_blocked_domains: Vec::new(),
        blocking_lists,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::fake::{FakeTsdb, sample};

    #[test]
    fn blocking_list_names() {
        assert_eq!(blocking_list("BLOCKED (ads)"), Some("ads"));
        assert_eq!(blocking_list("BLOCKED (malware list)"), Some("malware list"));
        assert_eq!(blocking_list("BLOCKED IP"), None);
        assert_eq!(blocking_list("CACHED (ads)"), None);
    }

    #[tokio::test]
    async fn full_stats() {
        let tsdb = FakeTsdb::default()
            .with(QUERY_TOTAL, vec![sample(&[], 1000.0)])
            .with(QUERY_BLOCKED, vec![sample(&[], 123.0)])
            .with(QUERY_PER_MINUTE, vec![sample(&[], 42.36)])
            .with(QUERY_CACHE_HITS, vec![sample(&[], 300.0)])
            .with(QUERY_CACHE_MISSES, vec![sample(&[], 100.0)])
            .with(
                QUERY_TOP_CLIENTS,
                vec![
                    sample(&[("client", "10.1.1.5")], 600.0),
                    sample(&[("client", "10.1.1.6")], 400.0),
                ],
            )
            .with(
                QUERY_BLOCK_REASONS,
                vec![
                    sample(&[("reason", "BLOCKED (ads)")], 100.0),
                    sample(&[("reason", "BLOCKED (tracking)")], 23.0),
                    sample(&[("reason", "BLOCKED IP")], 1.0),
                ],
            );

        let stats = dns_stats(&tsdb).await;
        assert_eq!(tsdb.query_count(), 7);
        assert!(stats.enabled);
        assert_eq!(stats.total_queries, 1000);
        assert_eq!(stats.blocked_queries, 123);
        assert_eq!(stats.block_percentage, 12.3);
        assert_eq!(stats.queries_per_minute, 42.4);
        assert_eq!(stats.cache_hit_rate, 75.0);
        assert_eq!(stats.top_clients.len(), 2);
        assert_eq!(stats.top_clients[0].ip, "10.1.1.5");
        assert_eq!(stats.top_clients[0].hostname, "10.1.1.5");
        assert_eq!(stats.top_clients[0].queries, 600);
        assert_eq!(stats.blocking_lists.len(), 2);
        assert_eq!(stats.blocking_lists["ads"], 100);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["top_blocked_domains"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn missing_total_is_disabled() {
        let tsdb = FakeTsdb::default().with(QUERY_BLOCKED, vec![sample(&[], 5.0)]);

        let stats = dns_stats(&tsdb).await;
        assert_eq!(stats, DnsStats::default());
        assert!(!stats.enabled);
        assert_eq!(
            serde_json::to_value(&stats).unwrap()["top_blocked_domains"],
            serde_json::json!([])
        );
    }

    #[tokio::test]
    async fn store_down_is_disabled() {
        let tsdb = FakeTsdb {
            fail: true,
            ..Default::default()
        };

        assert!(!dns_stats(&tsdb).await.enabled);
    }

    #[tokio::test]
    async fn zero_denominators() {
        let tsdb = FakeTsdb::default()
            .with(QUERY_TOTAL, vec![sample(&[], 0.0)])
            .with(QUERY_CACHE_HITS, vec![sample(&[], 0.0)])
            .with(QUERY_CACHE_MISSES, vec![sample(&[], 0.0)]);

        let stats = dns_stats(&tsdb).await;
        assert!(stats.enabled);
        assert_eq!(stats.block_percentage, 0.0);
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert!(stats.top_clients.is_empty());
    }
}
