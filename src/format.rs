// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

//! Human readable strings for the dashboard.

pub fn format_bytes(bytes: u64) -> String {
    let mut val = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if val < 1024.0 {
            return format!("{val:.1} {unit}");
        }
        val /= 1024.0;
    }

    format!("{val:.1} PB")
}

/// Formats bits per second with a 1000 base.
pub fn format_bandwidth(bps: f64) -> String {
    if bps < 1e3 {
        format!("{bps:.0} bps")
    } else if bps < 1e6 {
        format!("{:.1} Kbps", bps / 1e3)
    } else if bps < 1e9 {
        format!("{:.1} Mbps", bps / 1e6)
    } else {
        format!("{:.1} Gbps", bps / 1e9)
    }
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86400;
    let hours = secs % 86400 / 3600;
    let minutes = secs % 3600 / 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Rounds to one decimal place.
pub fn round1(val: f64) -> f64 {
    (val * 10.0).round() / 10.0
}
