//! Symbol map load.
//! This example puts random values drawn from a fixed set of distinct
//! symbols into one symbol map, and reports throughput of put.
use byte_unit::{Byte, ParseError};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tidedb_storage::prelude::*;

fn main() {
    env_logger::init();
    let args = Args::parse();

    let tmp;
    let dir = match &args.dir {
        Some(dir) => std::path::PathBuf::from(dir),
        None => {
            tmp = tempfile::tempdir().unwrap();
            tmp.path().to_path_buf()
        }
    };
    let conf = StorageConfig::default()
        .map_page_size(Byte::from_u64(args.page_size as u64))
        .bucket_divisor(args.bucket_divisor);
    let ff = OsFilesFacade::shared();
    create_symbol_map_files(
        ff.clone(),
        &conf,
        &dir,
        "bench",
        args.capacity,
        args.cache,
    )
    .unwrap();
    let mut writer = SymbolMapWriter::open(ff, &conf, &dir, "bench", 0).unwrap();

    let symbols: Vec<String> = (0..args.symbols)
        .map(|i| format!("sym-{:08x}", i))
        .collect();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let start = Instant::now();
    let mut count = 0u64;
    while start.elapsed() < args.duration {
        for _ in 0..1024 {
            let s = &symbols[rng.random_range(0..symbols.len())];
            writer.put(Some(s.as_str())).unwrap();
        }
        count += 1024;
    }
    let dur = start.elapsed();
    writer.sync(false);
    let ops = count as f64 * 1_000_000_000f64 / dur.as_nanos() as f64;
    println!(
        "symbols={},capacity={},cache={},dur={}ms,puts={},puts/s={:.0},op={:.2}ns",
        writer.symbol_count(),
        args.capacity,
        args.cache,
        dur.as_millis(),
        count,
        ops,
        dur.as_nanos() as f64 / count as f64,
    );
    writer.close();
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// directory of symbol map files, temporary directory if absent
    #[arg(long)]
    dir: Option<String>,

    /// number of distinct symbols
    #[arg(long, default_value = "10000")]
    symbols: usize,

    /// capacity of symbol map, decides hash bucket count
    #[arg(long, default_value = "16384")]
    capacity: i32,

    #[arg(long, default_value = "2")]
    bucket_divisor: u32,

    /// whether to cache symbols in memory
    #[arg(long, action = clap::ArgAction::Set, default_value = "true", value_parser = clap::builder::BoolishValueParser::new())]
    cache: bool,

    /// page size of value and offset files
    #[arg(long, default_value = "1MiB", value_parser = parse_byte_size)]
    page_size: usize,

    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    duration: Duration,

    #[arg(long, default_value = "0")]
    seed: u64,
}

#[inline]
fn parse_byte_size(input: &str) -> std::result::Result<usize, ParseError> {
    Byte::parse_str(input, true).map(|b| b.as_u64() as usize)
}
