// src/main.rs
//
// Thin CLI driver (spec.md §1: "CLI shells beyond a thin driver" are out of
// scope). Two subcommands: `build-fabric` runs C1→C2 and reports the result;
// `test` submits one detailed job end to end (C6→C5→C4→C3) and prints the
// per-service result documents. Exit codes follow spec.md §6: `0` success,
// `1` job failure, `2` invalid arguments / missing prerequisites.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use netreach_sim::config::RuntimeConfig;
use netreach_sim::fabric::nsexec::SystemExec;
use netreach_sim::tester::{DetailedJobSpec, ServiceSpec};
use netreach_sim::traits::{
    Protocol, TraceDoc, TraceHop, UnavailableProbeRunner, UnavailableServiceController,
    UnavailableTraceProvider,
};
use netreach_sim::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose (debug) logging; repeat for trace-level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load RouterFacts from `raw_facts_dir` and build the hidden-mesh fabric.
    BuildFabric,

    /// Submit one detailed reachability job and print its service result documents.
    Test {
        /// Unique identifier for this run.
        #[arg(long)]
        run_id: String,

        #[arg(long)]
        source_ip: Ipv4Addr,

        #[arg(long)]
        dest_ip: Ipv4Addr,

        /// One or more `port/proto` pairs, e.g. `443/tcp`.
        #[arg(long = "service", value_parser = parse_service, required = true)]
        services: Vec<ServiceSpec>,

        /// Trace file (JSON `TraceDoc`) bypassing the external trace facility.
        #[arg(long)]
        trace_file: Option<String>,

        /// Bare hop list (comma-separated router names) when a full trace
        /// document isn't available — convenience alternative to `--trace-file`.
        #[arg(long, value_delimiter = ',')]
        via: Vec<String>,
    },
}

fn parse_service(s: &str) -> Result<ServiceSpec, String> {
    let (port_str, proto_str) = s
        .split_once('/')
        .ok_or_else(|| format!("expected PORT/PROTO, got '{s}'"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("invalid port '{port_str}'"))?;
    let protocol = match proto_str.to_ascii_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => return Err(format!("unsupported protocol '{other}'")),
    };
    Ok(ServiceSpec { port, protocol })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => EnvFilter::new("netreach_sim=info"),
        1 => EnvFilter::new("netreach_sim=debug"),
        _ => EnvFilter::new("netreach_sim=trace"),
    };
    fmt::Subscriber::builder().with_env_filter(filter).init();

    let config = match RuntimeConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let engine = Engine::new(
        config,
        Arc::new(SystemExec),
        Arc::new(UnavailableTraceProvider),
        Arc::new(UnavailableServiceController),
        Arc::new(UnavailableProbeRunner),
    );

    match args.command {
        Command::BuildFabric => match engine.build_fabric().await {
            Ok((fabric, state)) => {
                println!(
                    "fabric built: {} router(s), {} namespace(s), {} bridge(s)",
                    fabric.router_count(),
                    state.created_namespaces.len(),
                    state.created_bridges.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("fabric build failed: {e}");
                ExitCode::FAILURE
            }
        },
        Command::Test {
            run_id,
            source_ip,
            dest_ip,
            services,
            trace_file,
            via,
        } => {
            let user_supplied_trace = match load_trace(trace_file.as_deref(), &via, source_ip, dest_ip) {
                Ok(trace) => trace,
                Err(e) => {
                    eprintln!("invalid trace input: {e}");
                    return ExitCode::from(2);
                }
            };

            let job = DetailedJobSpec {
                run_id,
                source_ip,
                source_port: None,
                dest_ip,
                services,
                user_supplied_trace,
                creator_tag: std::env::var("USER").ok(),
            };

            match engine.submit_detailed_job(job).await {
                Ok(docs) => {
                    match serde_json::to_string_pretty(&docs) {
                        Ok(json) => println!("{json}"),
                        Err(e) => eprintln!("failed to render result documents: {e}"),
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("job failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn load_trace(
    trace_file: Option<&str>,
    via: &[String],
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
) -> Result<Option<TraceDoc>, String> {
    if let Some(path) = trace_file {
        let raw = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
        let doc: TraceDoc = serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))?;
        return Ok(Some(doc));
    }
    if !via.is_empty() {
        return Ok(Some(TraceDoc {
            source_ip,
            dest_ip,
            hops: via
                .iter()
                .map(|router| TraceHop {
                    router: router.clone(),
                    incoming_interface: None,
                    outgoing_interface: None,
                })
                .collect(),
        }));
    }
    Ok(None)
}
