// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

//! Kea DHCPv4 memfile lease database.

use anyhow::{Context, Result};
use std::{collections::HashMap, path};

// address,hwaddr,client_id,valid_lifetime,expire,subnet_id,fqdn_fwd,fqdn_rev,hostname,state,...
const COL_ADDRESS: usize = 0;
const COL_HOSTNAME: usize = 8;
const COL_STATE: usize = 9;

const STATE_DEFAULT: &str = "0";

/// Returns the hostnames of active leases keyed by address.
fn parse_leases(csv: &str) -> HashMap<String, String> {
    let mut hostnames = HashMap::new();

    for line in csv.lines() {
        if line.starts_with("address,") {
            continue;
        }

        let cols: Vec<&str> = line.trim().split(',').collect();
        if cols.len() <= COL_STATE || cols[COL_STATE] != STATE_DEFAULT {
            continue;
        }

        let ip = cols[COL_ADDRESS];
        let hostname = cols[COL_HOSTNAME].trim_end_matches('.');
        if ip.is_empty() || hostname.is_empty() {
            continue;
        }

        // later lines are newer lease updates
        hostnames.insert(ip.to_string(), hostname.to_string());
    }

    hostnames
}

pub async fn read_leases(path: &path::Path) -> Result<HashMap<String, String>> {
    let csv = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;

    Ok(parse_leases(&csv))
}
