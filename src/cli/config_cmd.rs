//! Config subcommands: show, defaults, validate, policies.
//!
//! None of these start a pool.

use crate::capacity::CapacityRegistry;
use crate::config::PoolConfiguration;

use super::load_configuration;

/// Print the effective configuration as TOML.
pub fn run_show(path: Option<&str>) -> i32 {
    match load_configuration(path).and_then(|cfg| cfg.to_toml_string()) {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    }
}

/// Print the built-in defaults as TOML.
pub fn run_defaults() -> i32 {
    match PoolConfiguration::default().to_toml_string() {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    }
}

/// Validate the configuration and any capacity policies it names.
///
/// Returns 0 if valid, 1 on errors or warnings.
pub fn run_validate(path: Option<&str>) -> i32 {
    let cfg = match load_configuration(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };

    let mut problems = match cfg.validate() {
        Ok(warnings) => warnings,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };
    problems.extend(unknown_policies(&cfg, &CapacityRegistry::default()));

    if problems.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        for problem in &problems {
            eprintln!("WARNING: {problem}");
        }
        1
    }
}

/// List the registered capacity policies.
pub fn run_policies() -> i32 {
    let registry = CapacityRegistry::default();
    println!("incrementers: {}", registry.incrementer_names().join(", "));
    println!("decrementers: {}", registry.decrementer_names().join(", "));
    0
}

fn unknown_policies(cfg: &PoolConfiguration, registry: &CapacityRegistry) -> Vec<String> {
    let mut problems = Vec::new();
    if let Some(policy) = &cfg.capacity.incrementer {
        if !registry.has_incrementer(&policy.name) {
            problems.push(format!("unknown incrementer '{}', default will be used", policy.name));
        }
    }
    if let Some(policy) = &cfg.capacity.decrementer {
        if !registry.has_decrementer(&policy.name) {
            problems.push(format!("unknown decrementer '{}', default will be used", policy.name));
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{CapacityConfig, PolicyConfig};
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{text}").unwrap();
        file
    }

    #[test]
    fn test_validate_accepts_defaults_file() {
        let file = write_config("max_size = 10\n");
        assert_eq!(run_validate(file.path().to_str()), 0);
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let file = write_config("min_size = 8\nmax_size = 2\n");
        assert_eq!(run_validate(file.path().to_str()), 1);
    }

    #[test]
    fn test_validate_rejects_unparsable_file() {
        let file = write_config("max_size = \"many\"\n");
        assert_eq!(run_validate(file.path().to_str()), 1);
    }

    #[test]
    fn test_unknown_policies_reported() {
        let cfg = PoolConfiguration {
            capacity: CapacityConfig {
                incrementer: Some(PolicyConfig::named("Exponential")),
                decrementer: Some(PolicyConfig::named("Watermark")),
            },
            ..PoolConfiguration::default()
        };
        let problems = unknown_policies(&cfg, &CapacityRegistry::default());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("Exponential"));
    }

    #[test]
    fn test_defaults_and_policies_succeed() {
        assert_eq!(run_defaults(), 0);
        assert_eq!(run_policies(), 0);
    }
}
