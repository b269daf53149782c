//! FlowRunner CLI Entry Point
//!
//! Loads a definition file and executes it once.
//!
//! # Usage
//!
//! ```bash
//! # Execute a definition
//! flowrunner reconcile.yaml
//!
//! # With input
//! flowrunner reconcile.yaml --input '{"date": "2024-01-31"}'
//!
//! # Preview the step plan without running anything
//! flowrunner reconcile.yaml --dry-run
//!
//! # Engine settings and background execution
//! flowrunner reconcile.yaml --config engine.yaml --async
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde_json::Value;

use flowrunner::execution::{EchoHandler, ExecutionRequest, ExecutionResult, ExecutionStatus, JsonFileStore};
use flowrunner::workflow::{load_definition, Definition};
use flowrunner::{Engine, EngineConfig, APP_NAME, VERSION};

/// Caller identity recorded for CLI executions.
const CLI_CALLER: &str = "cli";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    definition_path: Option<String>,
    input: Option<String>,
    config_path: Option<String>,
    run_async: bool,
    dry_run: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow and Agent Execution Engine");
    println!();
}

fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Path to a YAML or JSON definition");
    println!();
    println!("Options:");
    println!("  --input JSON        Execution input (a JSON object)");
    println!("  --config FILE       Engine configuration YAML");
    println!("  --async             Run in the background and wait on the handle");
    println!("  --dry-run           Validate and print the step plan only");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner reconcile.yaml");
    println!("  flowrunner reconcile.yaml --input '{{\"date\": \"2024-01-31\"}}'");
    println!("  flowrunner assistant.json --config engine.yaml --async");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--async" => config.run_async = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => {
                i += 1;
                let value = args.get(i).ok_or("--input requires a JSON argument")?;
                config.input = Some(value.clone());
            }
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a path argument")?;
                config.config_path = Some(value.clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.definition_path.is_none() {
        return Err("a definition file is required".to_string());
    }

    Ok(config)
}

/// Parses the `--input` argument; absent input is an empty object.
fn parse_input(raw: Option<&str>) -> Result<Value, String> {
    match raw {
        Some(text) => serde_json::from_str(text).map_err(|e| format!("Invalid --input JSON: {}", e)),
        None => Ok(Value::Object(Default::default())),
    }
}

/// Prints the order steps are declared in, with their types and transitions.
fn print_plan(definition: &Definition) {
    println!(
        "{} '{}' ({:?}, v{}), entry: {}",
        "Plan for".bold(),
        definition.id,
        definition.kind,
        definition.version,
        definition.entry_step
    );
    for (index, step) in definition.steps.iter().enumerate() {
        let next = step.next.as_deref().unwrap_or("-");
        println!(
            "  {:>3}. {:<24} {:<14} on_error={:?} next={}",
            index + 1,
            step.id,
            step.config.type_name(),
            step.on_error,
            next
        );
    }
    if !definition.required_inputs.is_empty() {
        println!("  required inputs: {}", definition.required_inputs.join(", "));
    }
}

fn print_result(result: &ExecutionResult) -> Result<(), Box<dyn std::error::Error>> {
    let status = match result.status {
        ExecutionStatus::Completed => result.status.to_string().green().bold(),
        ExecutionStatus::Failed => result.status.to_string().red().bold(),
        _ => result.status.to_string().yellow(),
    };
    println!();
    println!(
        "Execution {} {} in {} ms ({} steps, {} failed, {} retries)",
        result.execution_id,
        status,
        result.metrics.duration_ms,
        result.metrics.steps_executed,
        result.metrics.steps_failed,
        result.metrics.retries
    );
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let definition_path = config.definition_path.unwrap_or_default();
    info!("Loading definition: {}", definition_path);
    let definition = load_definition(&definition_path).map_err(|e| {
        error!("Failed to load definition: {}", e);
        format!("Could not load definition from '{}': {}", definition_path, e)
    })?;

    if config.dry_run {
        info!("Mode: DRY RUN (nothing will execute)");
        print_plan(&definition);
        return Ok(ExitCode::SUCCESS);
    }

    let input = parse_input(config.input.as_deref())?;
    let store = Arc::new(JsonFileStore::new(&engine_config.store_dir));
    let engine = Engine::new(engine_config).with_store(store);
    engine.register_handler("echo", Arc::new(EchoHandler));

    let definition = engine.register(definition)?;
    let request = ExecutionRequest::new(definition.id.clone(), CLI_CALLER).with_input(input);

    let result = if config.run_async {
        let handle = engine.execute_async(request)?;
        info!("Scheduled execution {}", handle.execution_id());
        handle.wait().await?
    } else {
        engine.execute_sync(request).await?
    };

    print_result(&result)?;

    Ok(match result.status {
        ExecutionStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("flowrunner")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&[
            "wf.yaml",
            "--input",
            "{\"a\": 1}",
            "--config",
            "engine.yaml",
            "--async",
        ]))
        .unwrap();

        assert_eq!(config.definition_path.as_deref(), Some("wf.yaml"));
        assert_eq!(config.input.as_deref(), Some("{\"a\": 1}"));
        assert_eq!(config.config_path.as_deref(), Some("engine.yaml"));
        assert!(config.run_async);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["wf.yaml", "--input"])).is_err());
        assert!(parse_arguments(&args(&["wf.yaml", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(parse_input(Some("{\"n\": 2}")).unwrap(), json!({"n": 2}));
        assert!(parse_input(Some("{oops")).is_err());
    }
}
