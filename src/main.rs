use std::fs;
use std::path::Path;
use std::process;
use std::time::Instant;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use block_sort::{ExternalSorter, ExternalSorterBuilder, Generator, SortConfig, SortOutcome};

fn main() {
    let arg_parser = build_arg_parser();
    let (command, command_args) = match arg_parser.subcommand() {
        Some(subcommand) => subcommand,
        None => process::exit(2),
    };

    let log_level: LogLevel = command_args.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let config = build_config(command_args);
    let sorter: ExternalSorter<f64> = match ExternalSorterBuilder::new().with_config(config).build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let path = Path::new(command_args.value_of("path").expect("value is required"));
    let started = Instant::now();
    let stats_before = sorter.stats().snapshot();

    match command {
        "create" => create(&sorter, path, command_args),
        "sort" => sort(&sorter, path),
        "is_sorted" => check(&sorter, path),
        _ => unreachable!("unknown subcommands are rejected by the parser"),
    }

    if command != "is_sorted" {
        println!("elapsed time: {:.3} s", started.elapsed().as_secs_f64());
        println!("{}", sorter.stats().snapshot() - stats_before);
    }
}

fn create(sorter: &ExternalSorter<f64>, path: &Path, args: &clap::ArgMatches) {
    let records: u64 = args.value_of_t_or_exit("records");
    let seed: u64 = args.value_of_t_or_exit("seed");
    let low: f64 = args.value_of_t_or_exit("min");
    let high: f64 = args.value_of_t_or_exit("max");

    let generator = match Generator::new(seed, low, high) {
        Ok(generator) => generator,
        Err(err) => {
            log::error!("generator initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.create_file(path, records, &generator) {
        Ok(records) => println!("{} records written to {}", records, path.display()),
        Err(err) => {
            log::error!("data generation error: {}", err);
            process::exit(1);
        }
    }
}

fn sort(sorter: &ExternalSorter<f64>, path: &Path) {
    ensure_not_empty(path);

    match sorter.sort_file(path) {
        Ok(SortOutcome::AlreadySorted) => println!("{} is already sorted", path.display()),
        Ok(SortOutcome::Sorted { records, runs, passes }) => println!(
            "{} records sorted ({} runs, {} merge passes)",
            records, runs, passes
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

fn check(sorter: &ExternalSorter<f64>, path: &Path) {
    ensure_not_empty(path);

    match sorter.check_file(path) {
        Ok(None) => println!("sorted"),
        Ok(Some(index)) => println!("not sorted (record {} is out of order)", index),
        Err(err) => {
            log::error!("order checking error: {}", err);
            process::exit(1);
        }
    }
}

fn ensure_not_empty(path: &Path) {
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() > 0 => {}
        Ok(_) => {
            println!("file {} is empty, nothing to do", path.display());
            process::exit(1);
        }
        Err(_) => {
            println!("file {} does not exist, create it first", path.display());
            process::exit(1);
        }
    }
}

fn build_config(args: &clap::ArgMatches) -> SortConfig {
    let mut config = SortConfig::default();

    config.block_size = parse_size(args, "block_size") as usize;
    config.memory_budget = parse_size(args, "memory");
    config.cache_blocks = args.value_of_t_or_exit("cache_blocks");
    config.prefetch_blocks = args.value_of_t_or_exit("prefetch_blocks");
    config.io_threads = args.value_of_t_or_exit("io_threads");
    config.threads_number = args
        .is_present("threads")
        .then(|| args.value_of_t_or_exit("threads"));
    config.tmp_dir = args.value_of("tmp_dir").map(Into::into);
    config.direct_io = !args.is_present("no_direct_io");
    config.skip_if_sorted = !args.is_present("force");

    return config;
}

fn parse_size(args: &clap::ArgMatches, name: &str) -> u64 {
    args.value_of(name)
        .expect("value has a default")
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64()
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(size) if size.as_u64() > 0 => Ok(()),
        Ok(_) => Err("size must be positive".into()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn validate_finite(value: &str) -> Result<(), String> {
    match value.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(()),
        Ok(_) => Err("value must be finite".into()),
        Err(err) => Err(format!("value format incorrect: {}", err)),
    }
}

fn validate_positive(value: &str) -> Result<(), String> {
    match value.parse::<usize>() {
        Ok(value) if value > 0 => Ok(()),
        Ok(_) => Err("value must be positive".into()),
        Err(err) => Err(format!("value format incorrect: {}", err)),
    }
}

fn path_arg() -> clap::Arg<'static> {
    clap::Arg::new("path").help("data file").required(true).index(1)
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("block-sort")
        .about("external sort of binary f64 files")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            clap::App::new("create")
                .about("creates a file filled with pseudo-random records")
                .arg(path_arg()),
        )
        .subcommand(
            clap::App::new("sort")
                .about("sorts a file in place")
                .arg(path_arg()),
        )
        .subcommand(
            clap::App::new("is_sorted")
                .about("checks whether a file is sorted")
                .arg(path_arg()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .global(true)
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("records")
                .short('n')
                .long("records")
                .help("number of records to generate")
                .global(true)
                .takes_value(true)
                .default_value("1073741824")
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("block_size")
                .short('b')
                .long("block-size")
                .help("I/O block size")
                .global(true)
                .takes_value(true)
                .default_value("8MiB")
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("sorting memory budget")
                .global(true)
                .takes_value(true)
                .default_value("256MiB")
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("cache_blocks")
                .long("cache-blocks")
                .help("number of cached blocks for random access")
                .global(true)
                .takes_value(true)
                .default_value("8")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("prefetch_blocks")
                .long("prefetch-blocks")
                .help("number of blocks read ahead by sequential scans")
                .global(true)
                .takes_value(true)
                .default_value("2")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("seed")
                .short('s')
                .long("seed")
                .help("random number generator seed")
                .global(true)
                .takes_value(true)
                .default_value("42")
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("min")
                .long("min")
                .help("inclusive lower bound of generated values")
                .global(true)
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("0")
                .validator(validate_finite),
        )
        .arg(
            clap::Arg::new("max")
                .long("max")
                .help("exclusive upper bound of generated values")
                .global(true)
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("10000")
                .validator(validate_finite),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store the scratch file")
                .global(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .global(true)
                .takes_value(true)
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("io_threads")
                .long("io-threads")
                .help("number of threads serving asynchronous I/O")
                .global(true)
                .takes_value(true)
                .default_value("2")
                .validator(validate_positive),
        )
        .arg(
            clap::Arg::new("no_direct_io")
                .long("no-direct-io")
                .help("use buffered I/O instead of O_DIRECT")
                .global(true),
        )
        .arg(
            clap::Arg::new("force")
                .short('f')
                .long("force")
                .help("sort even if the file is already sorted")
                .global(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
