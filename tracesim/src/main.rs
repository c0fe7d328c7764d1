use std::fs::File;
use std::io::BufReader;
use std::time::Instant;

use clap::Parser;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use cachetree::config::HierarchyConfig;
use cachetree::io::read_trace;
use cachetree::simulator::Simulator;

#[derive(Parser, Debug)]
#[command(about = String::from("Trace-driven simulator for a hierarchy of CPU caches"))]
struct Args {
    /// JSON file describing the cache hierarchy
    config: String,
    /// Memory trace to replay, one `fetch|load|store <hex-addr> <bytes>` per line
    trace: String,

    /// Dump the counter snapshot as JSON instead of the plain report
    #[arg(short, long)]
    json: bool,

    /// Log every cache miss to stderr
    #[arg(short = 'm', long)]
    log_misses: bool,

    /// Print wall-clock timing after the report
    #[arg(short, long)]
    performance: bool,

    /// Increase diagnostic verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), String> {
    let start = Instant::now();
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .map_err(|e| format!("Couldn't initialise logging: {e}"))?;
    let config_file = File::open(&args.config)
        .map_err(|e| format!("Couldn't open the config file at path {}: {e}", args.config))?;
    let config: HierarchyConfig = serde_json::from_reader(BufReader::new(config_file))
        .map_err(|e| format!("Couldn't parse the config file: {e}"))?;
    let mut simulator = Simulator::new(&config);
    simulator.set_log(args.log_misses);
    let trace_file = File::open(&args.trace)
        .map_err(|e| format!("Couldn't open the trace file at path {}: {e}", args.trace))?;
    let trace = read_trace(trace_file)?;
    let result = simulator.simulate(&*trace)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&result)
            .map_err(|e| format!("Couldn't serialise the output: {e}"))?;
        println!("{rendered}");
    } else {
        let mut out = std::io::stdout().lock();
        simulator
            .write_report(&mut out)
            .map_err(|e| format!("Couldn't write the report: {e}"))?;
    }
    if args.performance {
        let total = start.elapsed();
        println!(
            "Simulation time: {}s",
            simulator.get_execution_time().as_nanos() as f64 / 1e9
        );
        println!(
            "Total execution time (includes parsing, configuration, and output): {}s",
            total.as_nanos() as f64 / 1e9
        );
    }
    Ok(())
}
