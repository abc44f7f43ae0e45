//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use acceptance_rig::core::config::Config;
use acceptance_rig::core::errors::{self, RigError};
use acceptance_rig::logger::activity::{
    ActivityEvent, ActivityLoggerHandle, CHANNEL_CAPACITY, spawn_logger,
};
use acceptance_rig::logger::jsonl::JsonlConfig;
use acceptance_rig::runner::loop_main::{
    AutoConfirm, Operator, RunReport, Runner, RunnerConfig,
};
use acceptance_rig::runner::signals::SignalHandler;
use acceptance_rig::script::Script;
use acceptance_rig::script::instruction::Instruction;
use acceptance_rig::sequencer::TestProfile;
use acceptance_rig::sequencer::outcome::{
    ResultSink, RunRecord, TeeSink, TestPointOutcome, Verdict,
};
use acceptance_rig::sequencer::policy::RunConclusion;
use acceptance_rig::sequencer::run::TestRun;
use acceptance_rig::terminal::ingest::spawn_ingest;
use acceptance_rig::terminal::{ChannelId, TerminalPair};
use acceptance_rig::transport::loopback::LoopbackTransport;
use acceptance_rig::transport::serial::{SerialTransport, list_ports};

/// arig: scripted hardware acceptance tests over MAIN/BOOT serial consoles.
#[derive(Debug, Parser)]
#[command(
    name = "arig",
    author,
    version,
    about = "Acceptance Rig - scripted hardware tests over serial consoles",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run a test script against the configured serial ports.
    Run(RunArgs),
    /// Run a test script against captured terminal output.
    Replay(ReplayArgs),
    /// List serial ports the OS reports.
    Ports,
    /// Inspect test scripts.
    Script(ScriptArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Test script (TOML).
    #[arg(long, short = 's', value_name = "SCRIPT")]
    script: PathBuf,
    /// MAIN console port, overriding config.
    #[arg(long = "main", value_name = "PORT")]
    main_port: Option<String>,
    /// BOOT console port, overriding config.
    #[arg(long = "boot", value_name = "PORT")]
    boot_port: Option<String>,
    /// Baud rate for both ports, overriding config.
    #[arg(long, value_name = "BAUD")]
    baud: Option<u32>,
    /// Expected copy size, substituted for `{bytes}` in desired outputs.
    #[arg(long, value_name = "N")]
    bytes: Option<u64>,
    /// Start the next attempt automatically after a failure.
    #[arg(long)]
    retry: bool,
    /// Confirm every operator prompt without asking.
    #[arg(long, short = 'y')]
    yes: bool,
    /// Abort an attempt after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
    /// Run variable for `{name}` placeholders (repeatable).
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,
    /// Results JSONL path, overriding config.
    #[arg(long, value_name = "PATH")]
    results: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ReplayArgs {
    /// Test script (TOML).
    #[arg(long, short = 's', value_name = "SCRIPT")]
    script: PathBuf,
    /// Captured MAIN console output.
    #[arg(long, value_name = "FILE")]
    main: Option<PathBuf>,
    /// Captured BOOT console output.
    #[arg(long, value_name = "FILE")]
    boot: Option<PathBuf>,
    /// Split captures into chunks of this many bytes, as a port would.
    #[arg(long, default_value_t = 64, value_name = "BYTES")]
    chunk: usize,
    /// Expected copy size, substituted for `{bytes}` in desired outputs.
    #[arg(long, value_name = "N")]
    bytes: Option<u64>,
    /// Give up after this many seconds.
    #[arg(long, default_value_t = 5, value_name = "SECONDS")]
    timeout: u64,
    /// Run variable for `{name}` placeholders (repeatable).
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,
    /// Also append results to this JSONL file.
    #[arg(long, value_name = "PATH")]
    results: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ScriptArgs {
    #[command(subcommand)]
    command: ScriptCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ScriptCommand {
    /// Parse and validate a script.
    Validate {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },
    /// Print a script's steps and checkpoints.
    Show {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The test ran and did not pass.
    #[error("{0}")]
    TestFailed(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::TestFailed(_) => 4,
        }
    }
}

impl From<RigError> for CliError {
    fn from(e: RigError) -> Self {
        match e {
            RigError::InvalidConfig { .. }
            | RigError::MissingConfig { .. }
            | RigError::ConfigParse { .. }
            | RigError::InvalidScript { .. }
            | RigError::ScriptParse { .. }
            | RigError::TestInhibited { .. } => Self::User(e.to_string()),
            RigError::Serialization { .. } => Self::Internal(e.to_string()),
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_live(cli, args),
        Command::Replay(args) => run_replay(cli, args),
        Command::Ports => run_ports(cli),
        Command::Script(args) => run_script(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}

// ──────────────────── console output ────────────────────

/// Prints test points as they happen, for interactive runs.
struct ConsoleSink {
    verbose: bool,
}

impl ResultSink for ConsoleSink {
    fn record_point(&self, outcome: &TestPointOutcome) {
        let verdict = match outcome.verdict {
            Verdict::Pass => "PASS".green().bold(),
            Verdict::Fail => "FAIL".red().bold(),
            Verdict::Additional => "INFO".cyan(),
        };
        println!(
            "  [{verdict}] step {:>3}  {}",
            outcome.instruction_index, outcome.actual_output
        );
        if self.verbose && outcome.verdict == Verdict::Fail {
            println!("           expected: {}", outcome.expected_output);
        }
    }

    fn record_run(&self, record: &RunRecord) {
        let line = format!(
            "{} attempt {}: {} ({}/{} steps)",
            record.test_name,
            record.attempt_number,
            record.status,
            record.completed_steps,
            record.total_steps
        );
        println!("{}", line.bold());
        if let Some(failure) = &record.failure {
            println!("  {}", failure.red());
        }
    }

    fn run_started(&self, test_name: &str, attempt_number: u32) {
        println!("{} {test_name} attempt {attempt_number}", "==>".blue().bold());
    }

    fn link_changed(&self, channel: ChannelId, connected: bool) {
        let state = if connected { "up".green() } else { "down".red() };
        println!("  {channel} link {state}");
    }

    fn note(&self, test_name: &str, message: &str) {
        if self.verbose {
            println!("  {} {test_name}: {message}", "note".dimmed());
        }
    }
}

/// Asks on stdin before leaving steps that need an operator.
struct StdinOperator;

impl Operator for StdinOperator {
    fn confirm(&mut self, test_name: &str, step: &Instruction) -> bool {
        print!("{} {test_name}: {} [Enter to confirm] ", "??".yellow().bold(), step.text);
        let _ = io::stdout().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => !answer.trim().eq_ignore_ascii_case("n"),
        }
    }
}

fn build_sink(
    cli: &Cli,
    logger: Option<&ActivityLoggerHandle>,
) -> Arc<dyn ResultSink> {
    let mut sinks: Vec<Arc<dyn ResultSink>> = Vec::new();
    if let Some(logger) = logger {
        sinks.push(Arc::new(logger.clone()));
    }
    if output_mode(cli) == OutputMode::Human && !cli.quiet {
        sinks.push(Arc::new(ConsoleSink {
            verbose: cli.verbose,
        }));
    }
    Arc::new(TeeSink(sinks))
}

fn emit_report(cli: &Cli, command: &str, report: &RunReport) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                let summary = match &report.conclusion {
                    RunConclusion::Passed { attempt } => {
                        format!("PASSED on attempt {attempt}").green().bold()
                    }
                    RunConclusion::Retry { attempts, remaining } => format!(
                        "FAILED ({attempts} failed, {remaining} attempts left)"
                    )
                    .red()
                    .bold(),
                    RunConclusion::Exhausted { attempts } => {
                        format!("FAILED, inhibited after {attempts} attempts").red().bold()
                    }
                    RunConclusion::Reset | RunConclusion::Pending => {
                        "STOPPED".yellow().bold()
                    }
                };
                println!("{}: {summary}", report.test_name);
                if report.timed_out {
                    println!("  attempt timed out");
                }
                println!(
                    "  {} attempt(s), {} ms, {} ticks",
                    report.attempts_started, report.elapsed_ms, report.ticks
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": command,
                "passed": report.passed(),
                "report": serde_json::to_value(report)?,
            });
            write_json_line(&payload)?;
        }
    }
    if report.passed() {
        Ok(())
    } else {
        Err(CliError::TestFailed(format!(
            "{} did not pass",
            report.test_name
        )))
    }
}

// ──────────────────── run / replay ────────────────────

fn load_profile(
    script_path: &Path,
    config: &Config,
    vars: &[(String, String)],
    bytes: Option<u64>,
) -> Result<TestProfile, CliError> {
    let script = Script::load(script_path)?;
    let mut profile = TestProfile::from_script(&script, config)?;
    if let Some(bytes) = bytes {
        profile = profile.with_var("bytes", bytes.to_string());
    }
    for (name, value) in vars {
        profile = profile.with_var(name.clone(), value.clone());
    }
    Ok(profile)
}

fn start_logger(
    config: &Config,
    path: &Path,
    script: &str,
) -> Result<(ActivityLoggerHandle, std::thread::JoinHandle<()>), CliError> {
    let (logger, join) = spawn_logger(JsonlConfig::at(path), CHANNEL_CAPACITY)?;
    logger.send(ActivityEvent::SessionStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash: config.stable_hash()?,
        script: script.to_string(),
    });
    Ok((logger, join))
}

fn stop_logger(
    logger: &ActivityLoggerHandle,
    join: std::thread::JoinHandle<()>,
    outcome: &errors::Result<RunReport>,
) {
    let reason = match outcome {
        Ok(r) if r.passed() => "passed".to_string(),
        Ok(r) if r.aborted => "aborted".to_string(),
        Ok(r) if r.timed_out => "timed out".to_string(),
        Ok(_) => "failed".to_string(),
        Err(e) => {
            logger.send(ActivityEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
            "error".to_string()
        }
    };
    logger.send(ActivityEvent::SessionStopped { reason });
    logger.shutdown();
    if join.join().is_err() {
        eprintln!("[ARIG-CLI] logger thread panicked");
    }
}

fn run_live(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = &args.main_port {
        config.serial.main_port = Some(port.clone());
    }
    if let Some(port) = &args.boot_port {
        config.serial.boot_port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if config.serial.main_port.is_none() && config.serial.boot_port.is_none() {
        return Err(CliError::User(
            "no serial port configured; pass --main and/or --boot".to_string(),
        ));
    }

    let profile = load_profile(&args.script, &config, &args.vars, args.bytes)?;
    let results = args
        .results
        .clone()
        .unwrap_or_else(|| config.paths.results_jsonl.clone());
    let (logger, logger_join) = start_logger(&config, &results, &profile.name)?;

    let terminals = Arc::new(TerminalPair::new(config.engine.buffer_capacity));
    let (ingest, ingest_join) = spawn_ingest(Arc::clone(&terminals))?;
    let transport = Arc::new(SerialTransport::new(&config.serial, ingest.clone()));
    if transport.open_all() == 0 {
        eprintln!("[ARIG-CLI] no port opened yet; link-gated steps will wait");
    }

    let sink = build_sink(cli, Some(&logger));
    let test = Arc::new(TestRun::new(
        profile,
        Arc::clone(&terminals),
        transport.clone(),
        sink,
    ));
    let operator: Box<dyn Operator> = if args.yes || !io::stdin().is_terminal() {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinOperator)
    };
    let mut runner = Runner::new(
        test,
        RunnerConfig {
            auto_retry: args.retry,
            attempt_timeout: args.timeout.map(Duration::from_secs),
            ..RunnerConfig::from_config(&config)
        },
    )
    .with_signals(SignalHandler::new())
    .with_operator(operator);

    let outcome = runner.run();

    transport.close();
    ingest.shutdown();
    let _ = ingest_join.join();
    stop_logger(&logger, logger_join, &outcome);

    emit_report(cli, "run", &outcome?)
}

fn read_capture(path: Option<&PathBuf>) -> Result<Option<Vec<u8>>, CliError> {
    path.map(|p| {
        fs::read(p).map_err(|e| CliError::User(format!("cannot read {}: {e}", p.display())))
    })
    .transpose()
}

fn run_replay(cli: &Cli, args: &ReplayArgs) -> Result<(), CliError> {
    if args.main.is_none() && args.boot.is_none() {
        return Err(CliError::User(
            "pass at least one capture with --main or --boot".to_string(),
        ));
    }
    let config = Config::load(cli.config.as_deref())?;
    let profile = load_profile(&args.script, &config, &args.vars, args.bytes)?;
    let captures: Vec<(ChannelId, Vec<u8>)> = [
        (ChannelId::Main, read_capture(args.main.as_ref())?),
        (ChannelId::Boot, read_capture(args.boot.as_ref())?),
    ]
    .into_iter()
    .filter_map(|(channel, bytes)| bytes.map(|b| (channel, b)))
    .collect();

    let logger = args
        .results
        .as_deref()
        .map(|path| start_logger(&config, path, &profile.name))
        .transpose()?;

    let terminals = Arc::new(TerminalPair::new(config.engine.buffer_capacity));
    let (ingest, ingest_join) = spawn_ingest(Arc::clone(&terminals))?;
    let sink = build_sink(cli, logger.as_ref().map(|(handle, _)| handle));
    let test = Arc::new(TestRun::new(
        profile,
        terminals,
        Arc::new(LoopbackTransport::connected()),
        sink,
    ));

    let feeder = ingest.clone();
    let chunk = args.chunk.max(1);
    let mut runner = Runner::new(
        test,
        RunnerConfig {
            tick_interval: Duration::from_millis(10),
            auto_retry: false,
            attempt_timeout: Some(Duration::from_secs(args.timeout)),
        },
    )
    .with_signals(SignalHandler::new())
    .on_attempt_started(move |_| {
        for (channel, bytes) in &captures {
            for piece in bytes.chunks(chunk) {
                if let Err(e) = feeder.deliver(*channel, piece) {
                    eprintln!("[ARIG-CLI] replay feed stopped: {e}");
                    return;
                }
            }
            let _ = feeder.end_of_stream(*channel);
        }
    });

    let outcome = runner.run();
    ingest.shutdown();
    let _ = ingest_join.join();
    if let Some((handle, join)) = logger {
        stop_logger(&handle, join, &outcome);
    }

    emit_report(cli, "replay", &outcome?)
}

// ──────────────────── inspection ────────────────────

fn run_ports(cli: &Cli) -> Result<(), CliError> {
    let ports = list_ports()?;
    match output_mode(cli) {
        OutputMode::Human => {
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in &ports {
                println!("{:<24} {}", port.name, port.kind);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "ports",
                "ports": serde_json::to_value(&ports)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_script(cli: &Cli, args: &ScriptArgs) -> Result<(), CliError> {
    match &args.command {
        ScriptCommand::Validate { script } => match Script::load(script) {
            Ok(parsed) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Script is valid.");
                        println!("  Name: {}", parsed.name);
                        println!("  Steps: {}", parsed.instructions.len());
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "script validate",
                            "valid": true,
                            "name": parsed.name,
                            "steps": parsed.instructions.len(),
                            "usb_transfer": parsed.transfer.as_ref().map(|t| t.command.as_str()),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Script is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "script validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid script: {}", script.display())))
            }
        },
        ScriptCommand::Show { script } => {
            let parsed = Script::load(script)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", parsed.name.bold());
                    if let Some(description) = &parsed.description {
                        println!("{description}");
                    }
                    if let Some(transfer) = &parsed.transfer {
                        println!(
                            "USB transfer: '{}' on {} after '{}'",
                            transfer.command, transfer.channel, transfer.banner
                        );
                    }
                    for (index, step) in parsed.instructions.iter().enumerate() {
                        print_step(index, step);
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "script show",
                        "script": serde_json::to_value(&parsed)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
    }
}

fn print_step(index: usize, step: &Instruction) {
    let channel = step.terminal.map_or("-", ChannelId::as_str);
    let mut flags = Vec::new();
    if step.special.is_some() {
        flags.push("special");
    }
    if step.user_ack_required {
        flags.push("ack");
    }
    if !step.reply.is_empty() {
        flags.push("reply");
    }
    if step.await_activity {
        flags.push("power-on");
    }
    if step.check_main_connected || step.check_boot_connected {
        flags.push("link");
    }
    println!("{index:>3}. [{channel:<4}] {}", step.text);
    if let Some(desired) = &step.desired_output {
        println!("       expect: {desired}");
    }
    if !flags.is_empty() {
        println!("       flags: {}", flags.join(", "));
    }
    if let Some(label) = &step.checkpoint {
        println!("       checkpoint: {}", label.cyan());
    }
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User("invalid configuration".to_string()))
            }
        },
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("ARIG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
