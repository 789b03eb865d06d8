// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

#![warn(missing_docs)]

//! Router Dashboard serves router health, client and bandwidth metrics to a
//! browser dashboard.

mod cache;
mod collector;
mod config;
mod format;
mod history;
mod hyper;
mod libc;
mod tsdb;

use log::{error, info};

fn init_logger() {
    let module = env!("CARGO_CRATE_NAME");
    let module_filter = if config::get().debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_module(module, module_filter)
        .init();
}

#[tokio::main]
async fn main() {
    let config = config::get();
    init_logger();

    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("querying time series from {}", config.vm_url);

    let collector = match collector::Collector::new(config) {
        Ok(collector) => collector,
        Err(err) => {
            error!("failed to initialize collector: {err:?}");
            return;
        }
    };

    if let Err(err) = hyper::run(&config.hyper_addr, collector).await {
        error!("failed to start web server: {err:?}");
    }
}
