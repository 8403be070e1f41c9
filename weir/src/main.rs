//! The weir binary: run the balancer demo over an in-memory network.
//!
//! With `--config`, the balancer is built from the given JSON document;
//! otherwise a three-backend demo topology is used. Configuration parse
//! failures are fatal.

use clap::Parser;
use std::{path::PathBuf, time::Duration};
use weir::{config::Config, demo::Demo};

const DEMO_CONFIG: &str = r#"{
    "clients": { "iface": 0, "port": 80, "waitq_limit": 1000, "session_limit": 1000 },
    "nodes":   { "iface": 1,
                 "list": [["10.0.1.101", 6001], ["10.0.1.102", 6001], ["10.0.1.103", 6001]] }
}"#;

#[derive(Debug, Parser)]
#[command(name = "weir", about = "A reverse-proxy load balancer demo")]
struct Args {
    /// Balancer configuration document.
    #[arg(long)]
    config: Option<PathBuf>,

    /// How many demo clients to run through the balancer.
    #[arg(long, default_value_t = 12)]
    clients: usize,

    /// Milliseconds per event-loop tick.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// Give up after this many ticks.
    #[arg(long, default_value_t = 10_000)]
    max_ticks: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().json().init();

    let args = Args::parse();
    let document = match &args.config {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEMO_CONFIG.to_string(),
    };
    let config = Config::from_json(&document)?;

    let mut demo = Demo::new(&config, args.clients)?;
    let tick = Duration::from_millis(args.tick_ms);

    for _ in 0..args.max_ticks {
        tokio::time::sleep(tick).await;
        if demo.tick(tick) {
            break;
        }
    }

    demo.report();
    if demo.completed() == args.clients {
        tracing::info!("All clients served");
        Ok(())
    } else {
        Err(format!(
            "Only {} of {} clients served",
            demo.completed(),
            args.clients
        )
        .into())
    }
}
