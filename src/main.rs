use clap::{Parser, ValueEnum};
use log::{error, info};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

mod classify;
mod loader;
mod models;
mod output;
mod probe;
mod tester;
mod utils;

use models::{TestResult, TestStatus};
use probe::RawSocketTransport;
use tester::RuleTester;

/// Firewall rule tester using crafted TCP/UDP probes
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML file containing firewall test cases
    #[clap(value_parser)]
    test_cases_file: PathBuf,

    /// Output format for the report
    #[clap(short = 'f', long, value_enum, default_value_t = OutputFormat::Console)]
    output_format: OutputFormat,

    /// Save the report to a file instead of printing it
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Per-probe timeout in seconds
    #[clap(short, long, default_value_t = 1.0)]
    timeout: f64,

    /// Local IPv4 address stamped on crafted packets (auto-detected when omitted)
    #[clap(long)]
    local_ip: Option<Ipv4Addr>,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Redirect log output to a file
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Use ANSI colors in the summary
    #[clap(long, default_value_t = true)]
    color: bool,
}

/// Report formats supported by the reporter
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Console,
    Json,
}

/// ANSI color codes for terminal output
struct Colors {
    green: String,
    yellow: String,
    red: String,
    reset: String,
}

impl Colors {
    fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                green: "\x1b[0;32m".to_string(),
                yellow: "\x1b[1;33m".to_string(),
                red: "\x1b[0;31m".to_string(),
                reset: "\x1b[0m".to_string(),
            }
        } else {
            Self {
                green: "".to_string(),
                yellow: "".to_string(),
                red: "".to_string(),
                reset: "".to_string(),
            }
        }
    }
}

/// Initialize logging with proper configuration
fn setup_logging(verbose: bool, log_file: Option<&PathBuf>) {
    let log_level = if verbose { "debug" } else { "info" };
    std::env::set_var("RUST_LOG", log_level);

    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp_secs()
        .format_module_path(false)
        .format_target(false);

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("Warning: Failed to open log file: {}. Using stderr instead.", e);
            }
        }
    }

    builder.init();
}

/// Colored one-line totals after the report
fn print_summary(results: &[TestResult], color: bool) {
    let colors = Colors::new(color);
    let passed = results
        .iter()
        .filter(|r| r.status == Some(TestStatus::Pass))
        .count();
    let failed = results
        .iter()
        .filter(|r| r.status == Some(TestStatus::Fail))
        .count();
    let skipped = results.len() - passed - failed;

    println!("{}[+]{} Passed: {}", colors.green, colors.reset, passed);
    println!("{}[!]{} Failed: {}", colors.red, colors.reset, failed);
    println!("{}[-]{} Skipped: {}", colors.yellow, colors.reset, skipped);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(args.verbose, args.log_file.as_ref());

    if !(args.timeout > 0.0 && args.timeout.is_finite()) {
        error!("Error: --timeout must be a positive number of seconds");
        process::exit(1);
    }

    info!(
        "[*] Starting firewall rule tester with test cases from: {}",
        args.test_cases_file.display()
    );

    let test_cases = match loader::load_test_cases(&args.test_cases_file) {
        Ok(cases) => cases,
        Err(e) => {
            error!("Error loading test cases: {}", e);
            process::exit(1);
        }
    };

    if test_cases.is_empty() {
        error!("Error: No test cases loaded. Exiting.");
        process::exit(1);
    }

    let transport =
        RawSocketTransport::new(args.local_ip, Duration::from_secs_f64(args.timeout));
    let tester = RuleTester::new(test_cases, Box::new(transport));
    let results = tester.run_tests().await;

    let report = match args.output_format {
        OutputFormat::Console => output::format_text_report(&results),
        OutputFormat::Json => match output::format_json_report(&results) {
            Ok(json) => json,
            Err(e) => {
                error!("Error rendering JSON report: {}", e);
                process::exit(1);
            }
        },
    };

    match &args.output {
        Some(path) => match output::save_report(&report, path) {
            Ok(()) => info!("[*] Report saved to: {}", path.display()),
            Err(e) => error!("Error: Could not write report: {}", e),
        },
        None => println!("{}", report),
    }

    print_summary(&results, args.color);

    // Exit status reflects input validity only, never individual verdicts.
    info!("[*] Firewall rule tester finished");
}
