use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{
    Layer, Registry, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

use dlna_control::{ControlPointConfig, Role, TARGET_ALL, TcpControlPoint, UdpSsdpChannel};
use tick_http::{TcpConnector, TcpListenerSource};

pub type Result<T = ()> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "dlna-control", about = "Discover and drive DLNA devices")]
struct Cli {
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Port for the local eventing server; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// SSDP search target.
    #[arg(long, default_value = TARGET_ALL)]
    target: String,

    /// How long to listen for discovery responses, in seconds.
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists discovered devices and their services.
    Discover,
    /// Subscribes to matching services and prints incoming events.
    Watch {
        /// Fragment of the service type to subscribe to.
        #[arg(default_value = "AVTransport")]
        service: String,
    },
    /// Prints the protocol info supported by discovered devices.
    ProtocolInfo,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = Targets::new()
        .with_target("dlna_control", level)
        .with_target("tick_http", level)
        .with_default(Level::WARN);

    Registry::default()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
}

fn build_control_point(port: u16) -> Result<TcpControlPoint> {
    let listener = TcpListenerSource::bind((Ipv4Addr::UNSPECIFIED, port))
        .context("failed to bind the eventing listener")?;
    let ssdp =
        UdpSsdpChannel::open(Ipv4Addr::UNSPECIFIED).context("failed to open the SSDP socket")?;

    Ok(TcpControlPoint::new(
        ControlPointConfig::default(),
        TcpConnector,
        listener,
        Box::new(ssdp),
    ))
}

/// Runs discovery to completion, ticking cooperatively.
fn discover(cp: &mut TcpControlPoint, target: &str, timeout: Duration) -> Result {
    cp.begin(target, Duration::from_secs(1), timeout)?;
    while cp.discovery_active() {
        if !cp.tick() {
            thread::sleep(cp.idle_delay());
        }
    }
    Ok(())
}

fn print_devices(cp: &TcpControlPoint) {
    if cp.devices().is_empty() {
        println!("No devices found.");
        return;
    }

    for device in cp.devices() {
        println!("{} ({})", device.friendly_name, device.location);
        println!("  type: {}", device.device_type);
        for service in &device.services {
            let eventing = if service.event_sub_url.is_some() {
                "eventing"
            } else {
                "no eventing"
            };
            println!("  service: {} [{}]", service.service_type, eventing);
        }
    }
}

fn watch(cp: &mut TcpControlPoint, service: &str) -> Result {
    cp.on_event(|sid, variable, value| {
        println!("[{sid}] {variable} = {value}");
    });

    let count = cp.subscribe_notifications(|_, info| info.service_type.contains(service))?;
    if count == 0 {
        println!("No matching services with eventing support.");
        return Ok(());
    }
    println!("Subscribed to {count} service(s); waiting for events. Ctrl-C to stop.");

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install the Ctrl-C handler")?;

    while running.load(Ordering::SeqCst) {
        if !cp.tick() {
            thread::sleep(cp.idle_delay());
        }
    }
    Ok(())
}

fn protocol_info(cp: &mut TcpControlPoint) -> Result {
    let services: Vec<_> = cp
        .devices()
        .iter()
        .filter_map(|device| {
            device
                .service_like("ConnectionManager")
                .map(|service| (device.friendly_name.clone(), service.clone()))
        })
        .collect();

    if services.is_empty() {
        println!("No devices with a ConnectionManager service.");
        return Ok(());
    }

    for (name, service) in services {
        println!("{name}:");
        cp.get_protocol_info(&service, |entry, role| {
            let direction = match role {
                Role::Source => "source",
                Role::Sink => "sink",
            };
            println!("  {direction}: {entry}");
        })?;
    }
    Ok(())
}

fn main() -> Result {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut cp = build_control_point(cli.port)?;
    let timeout = Duration::from_secs(cli.timeout.max(1));

    let started = Instant::now();
    discover(&mut cp, &cli.target, timeout)?;
    tracing::debug!(elapsed = ?started.elapsed(), devices = cp.devices().len(), "discovery done");

    let result = match cli.command {
        Command::Discover => {
            print_devices(&cp);
            Ok(())
        }
        Command::Watch { service } => watch(&mut cp, &service),
        Command::ProtocolInfo => protocol_info(&mut cp),
    };

    cp.end();
    result
}
