// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use crate::format;
use anyhow::{Context, Result, anyhow};
use log::{debug, error};
use serde::Serialize;
use std::time;

const PING_TIMEOUT: time::Duration = time::Duration::from_millis(1500);

/// Public resolvers probed for internet connectivity.
const TARGETS: [Target; 3] = [
    Target {
        host: "1.1.1.1",
        name: "Cloudflare DNS",
    },
    Target {
        host: "8.8.8.8",
        name: "Google DNS",
    },
    Target {
        host: "9.9.9.9",
        name: "Quad9 DNS",
    },
];

#[derive(Clone, Copy)]
struct Target {
    host: &'static str,
    name: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Check {
    pub host: String,
    pub name: String,
    pub reachable: bool,
    pub response_time: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Partial,
    Offline,
}

impl Status {
    fn text(&self) -> &'static str {
        match self {
            Status::Online => "Connected",
            Status::Partial => "Partial Connectivity",
            Status::Offline => "No Connection",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Connectivity {
    pub status: Status,
    pub status_text: &'static str,
    pub checks: Vec<Check>,
    pub reachable_count: usize,
    pub total_checks: usize,
    pub avg_response_time: Option<f64>,
}

/// Extracts the round trip time in ms from `ping` output.
fn parse_ping_time(out: &str) -> Option<f64> {
    out.lines().find_map(|line| {
        let (_, rest) = line.split_once("time=")?;
        rest.split_ascii_whitespace().next()?.parse().ok()
    })
}

pub fn classify(checks: Vec<Check>, total_checks: usize) -> Connectivity {
    let reachable_count = checks.iter().filter(|check| check.reachable).count();
    let status = if reachable_count == 0 {
        Status::Offline
    } else if reachable_count == total_checks {
        Status::Online
    } else {
        Status::Partial
    };

    let times: Vec<f64> = checks
        .iter()
        .filter(|check| check.reachable)
        .filter_map(|check| check.response_time)
        .collect();
    let avg_response_time = if times.is_empty() {
        None
    } else {
        Some(format::round1(times.iter().sum::<f64>() / times.len() as f64))
    };

    Connectivity {
        status,
        status_text: status.text(),
        checks,
        reachable_count,
        total_checks,
        avg_response_time,
    }
}

async fn ping(host: &str) -> Result<f64> {
    let cmd = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", "1", host])
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PING_TIMEOUT, cmd)
        .await
        .map_err(|_| anyhow!("ping {host} timed out"))?
        .context("failed to run ping")?;
    if !output.status.success() {
        return Err(anyhow!("ping {host} exited with {}", output.status));
    }

    parse_ping_time(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| anyhow!("no round trip time from ping {host}"))
}

async fn check(target: Target) -> Check {
    let response_time = match ping(target.host).await {
        Ok(ms) => Some(ms),
        Err(err) => {
            debug!("{err:?}");
            None
        }
    };

    Check {
        host: target.host.to_string(),
        name: target.name.to_string(),
        reachable: response_time.is_some(),
        response_time,
    }
}

/// Pings all targets in parallel.
pub async fn check_connectivity() -> Connectivity {
    let handles: Vec<_> = TARGETS
        .iter()
        .map(|&target| tokio::task::spawn(check(target)))
        .collect();

    let mut checks = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(check) => checks.push(check),
            Err(err) => error!("connectivity check failed: {err:?}"),
        }
    }

    classify(checks, TARGETS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(host: &str, response_time: Option<f64>) -> Check {
        Check {
            host: host.to_string(),
            name: host.to_string(),
            reachable: response_time.is_some(),
            response_time,
        }
    }

    #[test]
    fn ping_output() {
        let out = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=58 time=12.4 ms

--- 1.1.1.1 ping statistics ---
";
        assert_eq!(parse_ping_time(out), Some(12.4));
        assert_eq!(parse_ping_time("1 packets transmitted, 0 received"), None);
    }

    #[test]
    fn all_reachable_is_online() {
        let conn = classify(
            vec![
                check("a", Some(10.0)),
                check("b", Some(20.0)),
                check("c", Some(30.0)),
            ],
            3,
        );
        assert_eq!(conn.status, Status::Online);
        assert_eq!(conn.status_text, "Connected");
        assert_eq!(conn.reachable_count, 3);
        assert_eq!(conn.avg_response_time, Some(20.0));
    }

    #[test]
    fn some_reachable_is_partial() {
        let one = classify(
            vec![check("a", Some(15.0)), check("b", None), check("c", None)],
            3,
        );
        assert_eq!(one.status, Status::Partial);
        assert_eq!(one.avg_response_time, Some(15.0));

        let two = classify(
            vec![check("a", Some(10.0)), check("b", Some(11.0)), check("c", None)],
            3,
        );
        assert_eq!(two.status, Status::Partial);
        assert_eq!(two.reachable_count, 2);
        assert_eq!(two.avg_response_time, Some(10.5));
    }

    #[test]
    fn none_reachable_is_offline() {
        let conn = classify(vec![check("a", None), check("b", None), check("c", None)], 3);
        assert_eq!(conn.status, Status::Offline);
        assert_eq!(conn.status_text, "No Connection");
        assert_eq!(conn.avg_response_time, None);

        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["status"], "offline");
        assert!(json["avg_response_time"].is_null());
    }

    #[test]
    fn lost_checks_count_as_unreachable() {
        let conn = classify(vec![check("a", Some(5.0))], 3);
        assert_eq!(conn.status, Status::Partial);
        assert_eq!(conn.total_checks, 3);
    }
}
