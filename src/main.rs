// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::error::Error as _;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::{Arg, ArgAction, ArgMatches, Command};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use vmm::config::{self, VmConfig, VmParams};
use vmm::event_loop::EventLoop;
use vmm::Vmm;

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to parse the VM configuration: {0}")]
    ParseConfig(#[source] config::Error),
    #[error("Invalid VM configuration: {0}")]
    Validation(#[source] config::ValidationError),
    #[error("Failed to create the hypervisor: {0}")]
    Hypervisor(#[source] hypervisor::HypervisorError),
    #[error("Failed to serialize the capabilities: {0}")]
    Capabilities(#[source] serde_json::Error),
    #[error("Failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error("VMM error: {0}")]
    Vmm(#[source] vmm::Error),
}

fn create_app() -> Command {
    Command::new("tdx-host")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Launch a TDX trust domain.")
        .arg(
            Arg::new("cpus")
                .long("cpus")
                .help(
                    "boot=<boot_vcpus>,pmu=on|off,cpu_pm=on|off,\
                     host_tsx_broken=on|off,features=<feature1:feature2...>",
                )
                .default_value("boot=1")
                .num_args(1),
        )
        .arg(
            Arg::new("memory")
                .long("memory")
                .help("Memory parameters \"size=<guest_memory_size>\"")
                .default_value("size=512M")
                .num_args(1),
        )
        .arg(
            Arg::new("tdx")
                .long("tdx")
                .help(
                    "TDX parameters \"firmware=<tdvf_path>,sept_ve_disable=on|off,\
                     debug=on|off,mrconfigid=<hex>,mrowner=<hex>,mrownerconfig=<hex>,\
                     quote_generation_service=<unix:path|inet:host:port|vsock:cid:port>,\
                     migtd_pid=<pid>,migtd_hash=<hex>,migtd_attr=<attr>,vsockport=<port>,\
                     legacy_quote_abi=on|off\"",
                )
                .num_args(1),
        )
        .arg(
            Arg::new("tsc-khz")
                .long("tsc-khz")
                .help("TSC frequency of the guest in kHz")
                .value_parser(clap::value_parser!(u32))
                .num_args(1),
        )
        .arg(
            Arg::new("incoming")
                .long("incoming")
                .help("Wait for the TD state from a migration source")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("capabilities")
                .long("capabilities")
                .help("Print the TDX capabilities of the host as JSON and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .help("Set the level of debugging output")
                .action(ArgAction::Count),
        )
}

fn vm_config(matches: &ArgMatches) -> Result<VmConfig, Error> {
    // Arguments with a default value are always present.
    let cpus = matches
        .get_one::<String>("cpus")
        .map(String::as_str)
        .unwrap_or_default();
    let memory = matches
        .get_one::<String>("memory")
        .map(String::as_str)
        .unwrap_or_default();

    VmConfig::parse(VmParams {
        cpus,
        memory,
        tdx: matches.get_one::<String>("tdx").map(String::as_str),
        tsc_khz: matches.get_one::<u32>("tsc-khz").copied(),
        incoming: matches.get_flag("incoming"),
    })
    .map_err(Error::ParseConfig)
}

fn start_vmm(matches: &ArgMatches) -> Result<(), Error> {
    let vm_config = vm_config(matches)?;
    let hypervisor = hypervisor::new().map_err(Error::Hypervisor)?;

    if matches.get_flag("capabilities") {
        let report = vmm::capabilities_report(&vm_config, hypervisor).map_err(Error::Vmm)?;
        let json = serde_json::to_string_pretty(&report).map_err(Error::Capabilities)?;
        println!("{json}");
        return Ok(());
    }

    vm_config.validate().map_err(Error::Validation)?;
    if matches.get_flag("check") {
        info!("Configuration is valid");
        return Ok(());
    }

    let mut vmm = Vmm::new(vm_config, hypervisor).map_err(Error::Vmm)?;
    setup_signal_handler(vmm.event_loop().clone())?;
    vmm.boot().map_err(Error::Vmm)?;
    vmm.run().map_err(Error::Vmm)
}

fn setup_signal_handler(event_loop: Arc<EventLoop>) -> Result<(), Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Signals)?;
    thread::Builder::new()
        .name("signal_handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {}, shutting down", signal);
                event_loop.exit();
            }
        })
        .map_err(Error::Signals)?;
    Ok(())
}

fn main() {
    let matches = create_app().get_matches();

    let level = match matches.get_count("v") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(top_error) = start_vmm(&matches) {
        error!("{}", top_error);
        let mut source = top_error.source();
        while let Some(e) = source {
            error!("  caused by: {}", e);
            source = e.source();
        }
        process::exit(1);
    }
}
