use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use matching_core::broadcast::BroadcastSink;
use matching_core::engine::{Engine, EngineConfig};
use matching_core::wal::replay_file;

struct NullSink;

impl BroadcastSink for NullSink {
    fn deliver(&self, _payload: &str) -> Result<(), String> {
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        std::process::exit(2);
    };

    match cmd.as_str() {
        "inspect" => run_inspect(args.collect())?,
        "verify" => run_verify(args.collect())?,
        _ => {
            eprintln!("unknown subcommand: {cmd}");
            print_usage();
            std::process::exit(2);
        }
    }

    Ok(())
}

fn run_inspect(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let opts = parse_common_args(args)?;
    let summary = replay_file(&opts.wal)?;

    let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in &summary.records {
        *by_kind.entry(record.payload.kind()).or_default() += 1;
    }

    println!("wal_tool_action=inspect");
    println!("wal_tool_path={}", opts.wal.display());
    println!("wal_tool_records={}", summary.records.len());
    println!("wal_tool_malformed={}", summary.malformed);
    for (kind, count) in by_kind {
        println!("wal_tool_records_{kind}={count}");
    }
    Ok(())
}

fn run_verify(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let opts = parse_common_args(args)?;

    let mut cfg = EngineConfig::default();
    cfg.wal_path = opts.wal.clone();
    cfg.broadcast_workers = 1;

    let engine = Engine::new(cfg, Arc::new(NullSink))?;
    let stats = engine.stats();

    println!("wal_tool_action=verify");
    println!("wal_tool_path={}", opts.wal.display());
    println!("wal_tool_total_orders={}", stats.total_orders);
    println!("wal_tool_total_trades={}", stats.total_trades);
    println!("wal_tool_symbols={}", stats.symbols.len());
    for sym in &stats.symbols {
        let bid = sym
            .best_bid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ask = sym
            .best_ask
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("wal_tool_symbol_{}=bid:{bid},ask:{ask}", sym.symbol);
        let stops = engine.active_stops(&sym.symbol);
        println!("wal_tool_stops_{}={}", sym.symbol, stops.len());
    }

    engine.stop();
    Ok(())
}

#[derive(Debug, Clone)]
struct WalToolOptions {
    wal: PathBuf,
}

fn parse_common_args(args: Vec<String>) -> Result<WalToolOptions, Box<dyn std::error::Error>> {
    let mut wal = PathBuf::from("./data/wal.jsonl");

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--wal" => {
                let value = args
                    .get(i + 1)
                    .cloned()
                    .ok_or_else(|| "--wal requires value".to_string())?;
                wal = PathBuf::from(value);
                i += 2;
            }
            flag => return Err(format!("unknown flag: {flag}").into()),
        }
    }

    Ok(WalToolOptions { wal })
}

fn print_usage() {
    eprintln!("wal-tool usage:");
    eprintln!("  wal-tool inspect [--wal <path>]");
    eprintln!("  wal-tool verify [--wal <path>]");
}
