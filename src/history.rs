// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

//! Per-client bandwidth history for the dashboard charts.
//!
//! All requested IPs are fetched with one range query and aligned onto a
//! shared grid of timestamps ending at the query time, so every history has
//! the same labels and the same length regardless of gaps in the store.

use crate::{
    cache::TtlCache,
    tsdb::{Range, Series, TimeSeries},
};
use anyhow::{Context, Result};
use chrono::TimeZone;
use log::{debug, error};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fmt, net, sync, time,
};

const HISTORY_TTL: time::Duration = time::Duration::from_secs(15);
const DEFAULT_DURATION: u64 = 600;
// ten years
const MAX_DURATION: u64 = 3650 * 86400;

/// Points shown per chart.
pub const MAX_POINTS: usize = 100;

// (max duration, step) in seconds
const STEPS: [(u64, u64); 10] = [
    (600, 30),
    (1800, 60),
    (3600, 120),
    (10800, 300),
    (21600, 600),
    (43200, 900),
    (86400, 1800),
    (172800, 3600),
    (259200, 7200),
    (604800, 14400),
];
const STEP_MAX: u64 = 21600;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BandwidthHistory {
    pub ip: String,
    pub labels: Vec<String>,
    pub rx: Vec<f64>,
    pub tx: Vec<f64>,
}

pub type HistoryMap = HashMap<String, BandwidthHistory>;

/// Parses `10m`, `3h` or `7d` into seconds.
///
/// A missing or unknown unit falls back to ten minutes. Windows longer than
/// ten years are rejected.
pub fn parse_duration(duration: &str) -> Result<u64> {
    let mult = match duration.chars().last() {
        Some('m') => 60,
        Some('h') => 3600,
        Some('d') => 86400,
        _ => return Ok(DEFAULT_DURATION),
    };

    let num = &duration[..duration.len() - 1];
    let num: u64 = num
        .parse()
        .with_context(|| format!("invalid duration {duration:?}"))?;
    let secs = num
        .checked_mul(mult)
        .filter(|secs| *secs <= MAX_DURATION)
        .with_context(|| format!("duration {duration:?} is too long"))?;

    Ok(secs)
}

pub fn step_for(secs: u64) -> u64 {
    STEPS
        .iter()
        .find(|(max, _)| secs <= *max)
        .map_or(STEP_MAX, |(_, step)| *step)
}

fn label_format(secs: u64) -> &'static str {
    if secs <= 3600 {
        "%H:%M:%S"
    } else if secs <= 86400 {
        "%H:%M"
    } else if secs <= 604800 {
        "%m/%d %H:%M"
    } else {
        "%m/%d"
    }
}

/// Builds `a|b|c` for a PromQL `=~` matcher.
///
/// Strings that are not IP addresses are left out.
fn ip_regex(ips: &[String]) -> String {
    ips.iter()
        .filter(|ip| ip.parse::<net::IpAddr>().is_ok())
        .map(|ip| ip.replace('.', r"\\."))
        .collect::<Vec<_>>()
        .join("|")
}

/// Evenly spaced timestamps ending at `end`.
///
/// Only every `stride`-th slot is kept, so a grid never holds more than
/// `MAX_POINTS` points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Grid {
    end: i64,
    step: u64,
    slots: usize,
}

impl Grid {
    fn new(end: i64, secs: u64) -> Self {
        let step = step_for(secs);
        Grid {
            end,
            step,
            slots: (secs / step).max(1) as usize,
        }
    }

    fn start(&self) -> i64 {
        self.end - (self.slots as i64 - 1) * self.step as i64
    }

    /// Returns the slot nearest to `ts`.
    fn slot(&self, ts: f64) -> Option<usize> {
        let idx = ((ts - self.start() as f64) / self.step as f64).round();
        if idx >= 0.0 && idx < self.slots as f64 {
            Some(idx as usize)
        } else {
            None
        }
    }

    fn stride(&self) -> usize {
        self.slots.div_ceil(MAX_POINTS)
    }

    fn points(&self) -> usize {
        self.slots.div_ceil(self.stride())
    }

    /// Returns the kept point whose slot is nearest to `ts`.
    fn point(&self, ts: f64) -> Option<usize> {
        let stride = self.stride();
        self.slot(ts)
            .filter(|idx| idx % stride == 0)
            .map(|idx| idx / stride)
    }

    fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        let stride = self.stride() as i64;
        (0..self.points() as i64).map(move |pt| self.start() + pt * stride * self.step as i64)
    }
}

fn format_labels<Tz>(tz: &Tz, grid: &Grid, pattern: &str) -> Vec<String>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    grid.timestamps()
        .map(|ts| match tz.timestamp_opt(ts, 0).earliest() {
            Some(dt) => dt.format(pattern).to_string(),
            None => String::new(),
        })
        .collect()
}

/// Raw rx/tx samples of one IP before alignment.
#[derive(Default)]
struct Raw {
    timestamps: Vec<f64>,
    rx: Vec<f64>,
    tx: Vec<f64>,
}

impl Raw {
    /// Pairs the three arrays, padding short ones.
    ///
    /// Missing values become 0 and missing timestamps repeat the last known
    /// one, or `start` when there is none.
    fn pair(mut self, start: i64) -> Vec<(f64, f64, f64)> {
        let len = self.timestamps.len().max(self.rx.len()).max(self.tx.len());
        let last = self.timestamps.last().copied().unwrap_or(start as f64);

        self.timestamps.resize(len, last);
        self.rx.resize(len, 0.0);
        self.tx.resize(len, 0.0);

        self.timestamps
            .into_iter()
            .zip(self.rx)
            .zip(self.tx)
            .map(|((ts, rx), tx)| (ts, rx, tx))
            .collect()
    }
}

fn group_series(ips: &[String], series: Vec<Series>) -> HashMap<String, Raw> {
    let wanted: HashSet<&str> = ips.iter().map(String::as_str).collect();
    let mut raws: HashMap<String, Raw> = HashMap::new();

    for s in series {
        let Some(ip) = s.label("ip").filter(|ip| wanted.contains(ip)) else {
            continue;
        };
        let direction = s.label("direction").unwrap_or_default().to_string();
        let raw = raws.entry(ip.to_string()).or_default();

        let (timestamps, vals): (Vec<f64>, Vec<f64>) = s.points.into_iter().unzip();
        match direction.as_str() {
            "rx" => {
                raw.timestamps = timestamps;
                raw.rx = vals;
            }
            "tx" => {
                if raw.timestamps.is_empty() {
                    raw.timestamps = timestamps;
                }
                raw.tx = vals;
            }
            _ => (),
        }
    }

    raws
}

/// Aligns `series` onto the grid of a `secs` window ending at `end`.
///
/// Every IP in `ips` gets a history; IPs without data are all zeros.
fn resample<Tz>(ips: &[String], secs: u64, end: i64, series: Vec<Series>, tz: &Tz) -> HistoryMap
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let grid = Grid::new(end, secs);
    let labels = format_labels(tz, &grid, label_format(secs));
    let mut raws = group_series(ips, series);

    ips.iter()
        .map(|ip| {
            let mut rx = vec![0.0; grid.points()];
            let mut tx = vec![0.0; grid.points()];
            let mut filled = vec![false; grid.points()];

            if let Some(raw) = raws.remove(ip) {
                for (ts, rx_bps, tx_bps) in raw.pair(end - secs as i64) {
                    // padded points repeat a timestamp; the first sample wins
                    if let Some(idx) = grid.point(ts).filter(|idx| !filled[*idx]) {
                        rx[idx] = rx_bps;
                        tx[idx] = tx_bps;
                        filled[idx] = true;
                    }
                }
            }

            let history = BandwidthHistory {
                ip: ip.clone(),
                labels: labels.clone(),
                rx,
                tx,
            };
            (ip.clone(), history)
        })
        .collect()
}

fn cache_key(sorted_ips: &[String], duration: &str) -> String {
    format!("{}_{duration}", sorted_ips.join(","))
}

/// Bulk bandwidth histories with a short-lived cache.
pub struct Histories {
    tsdb: sync::Arc<dyn TimeSeries>,
    cache: TtlCache<String, sync::Arc<HistoryMap>>,
}

impl Histories {
    pub fn new(tsdb: sync::Arc<dyn TimeSeries>) -> Self {
        Histories {
            tsdb,
            cache: TtlCache::new(HISTORY_TTL),
        }
    }

    #[cfg(test)]
    fn with_clock(
        tsdb: sync::Arc<dyn TimeSeries>,
        clock: sync::Arc<dyn crate::cache::Clock>,
    ) -> Self {
        Histories {
            tsdb,
            cache: TtlCache::with_clock(HISTORY_TTL, clock),
        }
    }

    /// Returns the history of each of `ips` over `duration`.
    ///
    /// Only a malformed `duration` is an error; store failures yield zeros.
    pub async fn get(&self, ips: &[String], duration: &str) -> Result<sync::Arc<HistoryMap>> {
        let mut ips = ips.to_vec();
        ips.sort_unstable();
        ips.dedup();

        let key = cache_key(&ips, duration);
        if let Some(histories) = self.cache.get(&key) {
            debug!("using cached histories for {} clients", ips.len());
            return Ok(histories);
        }

        let secs = parse_duration(duration)?;
        let end = chrono::Utc::now().timestamp();

        let start = time::Instant::now();
        let series = self.fetch(&ips, secs, end).await;
        let histories = sync::Arc::new(resample(&ips, secs, end, series, &chrono::Local));
        debug!(
            "fetched {} client histories in {:.2}s with step={}s",
            histories.len(),
            start.elapsed().as_secs_f64(),
            step_for(secs)
        );

        self.cache.set(key, histories.clone());

        Ok(histories)
    }

    async fn fetch(&self, ips: &[String], secs: u64, end: i64) -> Vec<Series> {
        let regex = ip_regex(ips);
        if regex.is_empty() {
            return Vec::new();
        }

        let expr = format!(r#"client_traffic_rate_bps{{ip=~"{regex}"}}"#);
        let range = Range {
            start: end - secs as i64,
            end,
            step: step_for(secs),
        };

        match self.tsdb.query_range(&expr, range).await {
            Ok(series) => series,
            Err(err) => {
                error!("failed to fetch client histories: {err:?}");
                Vec::new()
            }
        }
    }
}
