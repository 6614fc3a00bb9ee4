//! jca-pool command-line entry point.
//!
//! ## Subcommands
//!
//! - `jca-pool-cli config show [FILE]` - Effective configuration
//! - `jca-pool-cli config defaults` - Built-in defaults
//! - `jca-pool-cli config validate [FILE]` - Validate (exit 0/1)
//! - `jca-pool-cli policies` - Registered capacity policies
//! - `jca-pool-cli simulate [FILE]` - Exercise an in-memory pool

use std::process::ExitCode;

use jca_pool::cli::{config_cmd, simulate_cmd};
use jca_pool::telemetry::{init_logging, LogConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {}", e);
    }

    let code = match command {
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            let file = args.get(3).map(|s| s.as_str());
            match subcommand {
                "show" => config_cmd::run_show(file),
                "defaults" => config_cmd::run_defaults(),
                "validate" => config_cmd::run_validate(file),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    1
                }
            }
        }
        "policies" => config_cmd::run_policies(),
        "simulate" => simulate_cmd::run_simulate(args.get(2).map(|s| s.as_str())),
        "help" | "--help" | "-h" => {
            print_usage();
            0
        }
        "version" | "--version" | "-V" => {
            println!("jca-pool {}", env!("CARGO_PKG_VERSION"));
            0
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            1
        }
    };

    ExitCode::from(code as u8)
}

fn print_usage() {
    println!(
        r#"jca-pool {}

USAGE:
    jca-pool-cli <COMMAND> [ARGS]

COMMANDS:
    config show [FILE]       Print the effective configuration as TOML
    config defaults          Print the built-in defaults as TOML
    config validate [FILE]   Validate configuration (exit 0 valid, 1 invalid)
    policies                 List registered capacity policies
    simulate [FILE]          Run concurrent allocations against an in-memory pool
    version                  Print version
    help                     Print this message

Without FILE, configuration is read from JCA_POOL_* environment variables.
Logging honors JCA_POOL_LOG_LEVEL, JCA_POOL_LOG_FORMAT and JCA_POOL_LOG_FILE."#,
        env!("CARGO_PKG_VERSION")
    );
}
