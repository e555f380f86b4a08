//! Minimal driver host: open the stick, boot the controller, interview
//! whatever the network reports, then sit and trace traffic until stdin
//! closes. The in-memory field store stands in for a real automation
//! host.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use zwusb_core::security::keys::{NetworkKey, DEFAULT_NETWORK_KEY, NETWORK_KEY_SIZE};
use zwusb_driver::fields::MemoryFieldStore;
use zwusb_driver::timings::SchedTimings;
use zwusb_driver::{ZwDriver, ZwDriverConfig};
use zwusb_logging::{ConsoleLogger, Loglevel};

struct Args {
    port: String,
    device_info_dir: Option<PathBuf>,
    network_key: NetworkKey,
    verbose: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut port = None;
    let mut device_info_dir = None;
    let mut network_key = DEFAULT_NETWORK_KEY;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--devinfo" => {
                let dir = args.next().ok_or("--devinfo needs a directory")?;
                device_info_dir = Some(PathBuf::from(dir));
            }
            "--key" => {
                let hex_key = args.next().ok_or("--key needs a hex value")?;
                let bytes = hex::decode(&hex_key).map_err(|e| format!("bad key: {e}"))?;
                network_key = bytes
                    .try_into()
                    .map_err(|_| format!("key must be {NETWORK_KEY_SIZE} bytes"))?;
            }
            "--verbose" => verbose = true,
            other if port.is_none() => port = Some(other.to_string()),
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }

    Ok(Args {
        port: port.ok_or("usage: zwusb <port> [--devinfo <dir>] [--key <hex>] [--verbose]")?,
        device_info_dir,
        network_key,
        verbose,
    })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let level = if args.verbose {
        Loglevel::Debug
    } else {
        Loglevel::Info
    };
    let logger = Arc::new(ConsoleLogger::new(level));
    let fields = Arc::new(MemoryFieldStore::new());

    let driver = match ZwDriver::new(
        fields,
        ZwDriverConfig {
            network_key: args.network_key,
            device_info_dir: args.device_info_dir,
            timings: SchedTimings::default(),
            logger: Some(logger),
        },
    ) {
        Ok(driver) => driver,
        Err(err) => {
            eprintln!("driver setup failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = driver.start_on_port(&args.port) {
        eprintln!("cannot open {}: {err}", args.port);
        return ExitCode::FAILURE;
    }

    let nodes = match driver.bootstrap() {
        Ok(nodes) => nodes,
        Err(err) => {
            eprintln!("controller bootstrap failed: {err}");
            driver.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let ids = driver.controller_ids().expect("bootstrap sets the ids");
    println!(
        "home {:08x}, controller node {}, {} other nodes",
        ids.home_id,
        ids.node_id,
        nodes.len()
    );

    for node in nodes {
        let name = format!("Unit{node}");
        match driver.interview_and_bind(node, &name) {
            Ok(()) => println!("bound node {node} as {name}"),
            Err(err) => println!("node {node} not bound: {err}"),
        }
    }

    println!("running; press enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    driver.shutdown();
    ExitCode::SUCCESS
}
