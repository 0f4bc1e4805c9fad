// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI front end: parses the short-option flag grammar into a
//! [`segvault::config::Options`] and runs the driver.

use clap::Parser;
use segvault::config::Builder;
use segvault::driver;
use segvault::report;
use segvault::shm::SystemV;
use std::path::PathBuf;

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};

    ($msg:literal) => {{
        eprintln!($msg);
        std::process::exit(1);
    }};
}

/// Backs up and restores System V shared-memory namespace segments.
#[derive(Parser, Debug)]
#[command(name = "segvault")]
#[command(about = "Backs up and restores System V shared-memory namespace segments")]
struct Args {
    /// Analyze only: print what would be done, do not modify state.
    #[arg(short = 'a')]
    analyze: bool,

    /// Back up shared-memory segments to files.
    #[arg(short = 'b')]
    backup: bool,

    /// Compare CRC32 between segment and file at each transfer.
    #[arg(short = 'c')]
    crc32: bool,

    /// Filter by instance.
    #[arg(short = 'i', default_value_t = 0)]
    instance: u8,

    /// Comma-separated namespace names to process.
    #[arg(short = 'n', value_delimiter = ',')]
    names: Vec<String>,

    /// Backup directory.
    #[arg(short = 'p')]
    dir: Option<PathBuf>,

    /// Restore shared-memory segments from files.
    #[arg(short = 'r')]
    restore: bool,

    /// Max I/O threads (1..1024). Default is the host CPU count.
    #[arg(short = 't')]
    threads: Option<usize>,

    /// Verbose progress output.
    #[arg(short = 'v')]
    verbose: bool,

    /// gzip files on backup (no effect on restore).
    #[arg(short = 'z')]
    gzip: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.gzip && args.restore {
        log::warn!("-z has no effect on restore");
    }

    let mut builder = Builder::new()
        .backup(args.backup)
        .restore(args.restore)
        .analyze(args.analyze)
        .compress(args.gzip)
        .verify_crc32(args.crc32)
        .instance(args.instance)
        .namespaces(args.names)
        .verbose(args.verbose);

    if let Some(dir) = args.dir {
        builder = builder.dir(dir);
    }
    if let Some(threads) = args.threads {
        builder = builder.max_threads(threads);
    }

    let options = match builder.build() {
        Ok(options) => options,
        Err(err) => die!("{err}"),
    };

    if matches!(options.mode, segvault::config::Mode::Backup) && !options.analyze {
        if let Err(err) = std::fs::create_dir_all(&options.dir) {
            die!("could not create backup directory: {err}");
        }
    } else if !options.dir.is_dir() {
        die!("{}", format!("{} is not a directory", options.dir.display()));
    }

    let backend = SystemV;
    let results = driver::run(&backend, &options);

    let mut failed = false;
    let mut rows = Vec::with_capacity(results.len());
    for result in &results {
        let outcome = match &result.result {
            Ok(_) if options.analyze => "analyzed".to_string(),
            Ok(_) => "ok".to_string(),
            Err(err) => {
                failed = true;
                format!("error: {err}")
            }
        };
        rows.push(report::Row {
            namespace: result.namespace.clone(),
            outcome,
            bytes: result.result.as_ref().copied().unwrap_or(0),
            elapsed: result.elapsed,
        });
    }

    print!("{}", report::format_table(&rows));

    std::process::exit(i32::from(failed));
}
