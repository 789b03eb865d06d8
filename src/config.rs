// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use clap::{Arg, ArgAction, Command, value_parser};
use std::{path, sync};

pub struct Config {
    pub debug: bool,
    pub procfs_path: &'static path::Path,
    pub hyper_addr: String,
    pub vm_url: String,
    pub lan_dev: String,
    pub kea_leases: path::PathBuf,
}

fn command() -> Command {
    Command::new("router-dashboard")
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("host").long("host").default_value("localhost"))
        .arg(
            Arg::new("port")
                .long("port")
                .value_parser(value_parser!(u16))
                .default_value("8085"),
        )
        .arg(
            Arg::new("bind_all")
                .long("bind-all")
                .help("Listen on all interfaces")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("vm_url")
                .long("vm.url")
                .default_value("http://localhost:8428"),
        )
        .arg(
            Arg::new("lan_dev")
                .long("lan.interface")
                .default_value("br-lan"),
        )
        .arg(
            Arg::new("kea_leases")
                .long("kea.leases")
                .default_value("/var/lib/kea/kea-leases4.csv"),
        )
}

fn parse_args(matches: clap::ArgMatches) -> Config {
    let debug = matches.get_flag("debug");
    let procfs_path = path::Path::new("/proc");

    let host = if matches.get_flag("bind_all") {
        "0.0.0.0"
    } else {
        matches.get_one::<String>("host").unwrap()
    };
    let port = *matches.get_one::<u16>("port").unwrap();
    let hyper_addr = format!("{host}:{port}");

    let vm_url = matches.get_one::<String>("vm_url").unwrap().clone();
    let lan_dev = matches.get_one::<String>("lan_dev").unwrap().clone();
    let kea_leases = path::PathBuf::from(matches.get_one::<String>("kea_leases").unwrap());

    Config {
        debug,
        procfs_path,
        hyper_addr,
        vm_url,
        lan_dev,
        kea_leases,
    }
}

pub fn get() -> &'static Config {
    static CONFIG: sync::LazyLock<Config> =
        sync::LazyLock::new(|| parse_args(command().get_matches()));
    &CONFIG
}
