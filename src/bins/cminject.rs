use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, trace};

use coreinject::addr::Addr;
use coreinject::config::{parse_number, InjectionConfig};
use coreinject::errors::InjectorError;
use coreinject::injector::Injector;
use coreinject::memorymap::AddressSpaceMap;
use coreinject::placement::ReachableAddressFinder;
use coreinject::symbols::DlResolver;
use coreinject::tracer::Ptrace;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
Authors: {author-with-newline}
"#
)]
/// Inject a function from a shared library into a running process
///
/// The process is stopped at a breakpoint, the code of the function is written into it and a
/// function pointer slot of the process is pointed at the written code.
struct Args {
    /// More log output, can be repeated
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the mapped ranges and free regions of a process
    Maps {
        #[arg(short, long)]
        pid: i32,
    },
    /// Print where code reachable from an address would be placed
    Place {
        #[arg(short, long)]
        pid: i32,
        /// Reference address, decimal or 0x prefixed
        #[arg(short, long, value_parser = parse_addr)]
        target: Addr,
        /// Bytes that have to fit at the placement
        #[arg(short, long, default_value_t = 1)]
        len: usize,
    },
    /// Run an injection described by a JSON config file and print a JSON report
    Inject {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides the pid from the config file
        #[arg(short, long)]
        pid: Option<i32>,
    },
}

fn parse_addr(s: &str) -> Result<Addr, InjectorError> {
    Ok(Addr::from(parse_number(s)?))
}

fn main() -> Result<(), InjectorError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);

    let res = match args.command {
        Command::Maps { pid } => maps(pid),
        Command::Place { pid, target, len } => place(pid, target, len),
        Command::Inject { config, pid } => inject(config, pid),
    };
    if let Err(e) = &res {
        error!("{e}");
    }
    res
}

fn maps(pid: i32) -> Result<(), InjectorError> {
    let map = AddressSpaceMap::from_pid(pid)?;
    print!("{map}");
    let free = map.free_regions();
    println!("Free regions: {}", free.len());
    for (i, region) in free.iter().enumerate() {
        println!("#{i}: {region}");
    }
    Ok(())
}

fn place(pid: i32, target: Addr, len: usize) -> Result<(), InjectorError> {
    let map = AddressSpaceMap::from_pid(pid)?;
    if map.is_empty() {
        return Err(InjectorError::MapParse {
            pid,
            reason: "no mapped ranges".into(),
        });
    }
    match ReachableAddressFinder::new(&map).find(target, len) {
        Some(addr) => {
            println!("{addr}");
            Ok(())
        }
        None => Err(InjectorError::NoPlacementFound { target, len }),
    }
}

fn inject(path: PathBuf, pid: Option<i32>) -> Result<(), InjectorError> {
    let mut config = InjectionConfig::from_file(&path)?;
    if pid.is_some() {
        config.pid = pid;
        config.validate()?;
    }

    let mut resolver = DlResolver::new();
    let report = Injector::new(&config).run(Ptrace, &mut resolver)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn setup_logger(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stderr, stdout is for results
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
    trace!("set up the logger");
}
