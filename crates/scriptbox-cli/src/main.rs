//! scriptbox CLI - The `scriptbox` command.
//!
//! Runs audio/MIDI processing scripts outside a plugin host, the same way a
//! plugin instance would: load, prepare, feed blocks, reload on change.
//!
//! # Architecture
//!
//! - **scriptbox-core**: runtime, execution contexts, block processing
//! - **events**: text event files fed to `scriptbox run`

mod events;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use events::EventSchedule;
use scriptbox_core::{AudioBuffer, Config, Error, ExecutionReport, ScriptProcessor};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// scriptbox - Rhai scripts for audio and MIDI
#[derive(Parser, Debug)]
#[command(name = "scriptbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Rhai audio/MIDI processing scripts", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Additional import directories
    #[arg(short = 'I', long = "import-path", value_name = "PATH", global = true)]
    import_paths: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script over a sequence of blocks and print the MIDI output
    Run {
        /// Path to the .rhai script
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// Event file: one `<block> <offset> <hex bytes...>` per line
        #[arg(short, long, value_name = "FILE")]
        events: Option<PathBuf>,

        /// Number of blocks to run (default: enough for every event)
        #[arg(short, long)]
        blocks: Option<usize>,

        #[arg(long, default_value_t = 44_100.0)]
        sample_rate: f64,

        #[arg(long, default_value_t = 512)]
        block_size: usize,

        /// Audio channels (inputs and outputs)
        #[arg(long, default_value_t = 2)]
        channels: usize,
    },

    /// Execute a script and report its entry points and MIDI outputs
    Check {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },

    /// Load a script and re-execute it whenever it changes
    Watch {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let mut config = Config::load_or_default();
    config.script.import_paths.extend(args.import_paths);

    match args.command {
        Commands::Run {
            script,
            events,
            blocks,
            sample_rate,
            block_size,
            channels,
        } => {
            config.reload.enabled = false;
            run_script(
                config,
                &script,
                events.as_deref(),
                blocks,
                sample_rate,
                block_size,
                channels,
            )
        }
        Commands::Check { script } => {
            config.reload.enabled = false;
            check_script(config, &script)
        }
        Commands::Watch { script } => {
            config.reload.enabled = true;
            watch_script(config, &script)
        }
        Commands::Version => {
            println!("scriptbox {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Rhai scripting for real-time audio and MIDI");
            match Config::config_path() {
                Ok(path) => println!("Config file: {}", path.display()),
                Err(err) => println!("Config file: unavailable ({})", err),
            }
            Ok(())
        }
    }
}

/// Load `script`, treating only an unreadable file as fatal.
///
/// A script that faults still leaves a usable pass-through processor.
fn load(processor: &mut ScriptProcessor, script: &Path) -> Result<Option<ExecutionReport>> {
    match processor.load_script(script) {
        Ok(report) => Ok(Some(report)),
        Err(Error::Io(err)) => {
            Err(err).with_context(|| format!("Failed to read {}", script.display()))
        }
        Err(err) => {
            log::error!("{}", err);
            Ok(None)
        }
    }
}

fn print_report(report: &ExecutionReport) {
    println!("Entry points: {}", report.capabilities);
    println!("MIDI outputs: {}", report.outputs);
    if let Some(fault) = &report.template_fault {
        println!("  (ignored: {})", fault);
    }
}

fn run_script(
    config: Config,
    script: &Path,
    events: Option<&Path>,
    blocks: Option<usize>,
    sample_rate: f64,
    block_size: usize,
    channels: usize,
) -> Result<()> {
    let schedule = match events {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            EventSchedule::parse(&text)
                .with_context(|| format!("Invalid event file {}", path.display()))?
        }
        None => EventSchedule::default(),
    };
    let block_count = blocks.unwrap_or_else(|| schedule.block_count().max(1));

    let mut processor = ScriptProcessor::new(config);
    if let Some(report) = load(&mut processor, script)? {
        print_report(&report);
    }
    processor.prepare(sample_rate, block_size)?;

    for block in 0..block_count {
        let mut audio = AudioBuffer::new(channels, channels, block_size);
        let mut midi = schedule.block(block);
        let report = processor.process_block(&mut audio, &mut midi)?;

        println!(
            "block {}: {} events ({} passed through, {} emitted, {} suppressed, {} skipped)",
            block,
            midi.len(),
            report.passed_through,
            report.emitted,
            report.suppressed,
            report.skipped
        );
        for event in &midi {
            println!("  @{:<5} {}", event.offset, event.message);
        }
        for fault in &report.faults {
            println!("  fault: {}", fault);
        }

        let peak = (0..audio.output_channels())
            .filter_map(|c| audio.channel(c))
            .flat_map(|samples| samples.iter())
            .fold(0.0f32, |peak, s| peak.max(s.abs()));
        if peak > 0.0 {
            println!("  audio peak: {:.4}", peak);
        }
    }

    Ok(())
}

fn check_script(config: Config, script: &Path) -> Result<()> {
    let mut processor = ScriptProcessor::new(config);
    let Some(report) = load(&mut processor, script)? else {
        bail!("{} failed to execute", script.display());
    };
    print_report(&report);

    for (slot, template) in processor.context().output_templates().iter().enumerate() {
        let hex = |bytes: &[u8]| {
            bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };
        println!(
            "  [{}] {} <value> {}",
            slot,
            hex(&template.prefix),
            hex(&template.suffix)
        );
    }
    Ok(())
}

fn watch_script(config: Config, script: &Path) -> Result<()> {
    let quit = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, quit.clone())
            .context("Failed to install signal handler")?;
    }

    let mut processor = ScriptProcessor::new(config);
    if let Some(report) = load(&mut processor, script)? {
        print_report(&report);
    }

    log::info!("Watching {} (Ctrl+C to exit)", script.display());
    while !quit.load(Ordering::Relaxed) {
        if processor.pump_reloads() > 0 {
            println!("Reloaded {}", processor.program_name());
            println!("Entry points: {}", processor.context().capabilities());
            println!("MIDI outputs: {}", processor.context().output_templates().len());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    log::info!("Exiting...");
    Ok(())
}
