//! Command-line interface for malidrm

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use malidrm::driver::{DriverDescriptor, MALI_DRIVER_FOPS};
use malidrm::gpu::MALI_IOCTLS;
use malidrm::simulate::{self, SimReport};
use malidrm::{load_board_config, ModuleInfo};

#[derive(Parser)]
#[command(name = "malidrm")]
#[command(version = malidrm::VERSION)]
#[command(about = "Mali-400 DRM driver glue, run against a simulated host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal, env = "MALIDRM_VERBOSITY")]
    verbosity: Verbosity,
}

#[derive(Subcommand)]
enum Commands {
    /// Show module metadata, ioctl table and file operations
    Info {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check which compatible strings the driver would probe
    Match {
        /// Device-tree compatible strings
        #[arg(required = true)]
        compatible: Vec<String>,
    },

    /// Run the driver lifecycle for a board description
    Simulate {
        /// Board description (JSON)
        #[arg(short, long)]
        board: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Export the report to a JSON file
        #[arg(long)]
        json_output: Option<String>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Minimal,
    Normal,
    Detailed,
    Debug,
}

impl Verbosity {
    fn level(self) -> LevelFilter {
        match self {
            Verbosity::Minimal => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Warn,
            Verbosity::Detailed => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbosity.level())
        .parse_default_env()
        .init();

    match &cli.command {
        Commands::Info { format } => {
            let info = ModuleInfo::current();
            match format {
                OutputFormat::Text => print_info_text(&info),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            }
        }

        Commands::Match { compatible } => {
            let mut any = false;
            for compat in compatible {
                let supported = malidrm::is_supported(compat);
                any |= supported;
                println!("{} {}", if supported { "✅" } else { "❌" }, compat);
            }
            if !any {
                bail!("none of the compatible strings is served by {}", malidrm::driver::INFO.name);
            }
        }

        Commands::Simulate { board, format, json_output } => {
            let config = load_board_config(board).with_context(|| format!("loading board {}", board))?;
            let report = simulate::run(&config).context("simulation failed")?;

            match format {
                OutputFormat::Text => print_report_text(&report),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }

            if let Some(path) = json_output {
                std::fs::write(path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("writing {}", path))?;
                println!("\n✅ Report exported to: {}", path);
            }

            if report.leaked() > 0 {
                bail!("{} allocations leaked", report.leaked());
            }
        }
    }

    Ok(())
}

fn print_info_text(info: &ModuleInfo) {
    let mut descriptor = DriverDescriptor::new(MALI_IOCTLS);
    descriptor.num_ioctls = descriptor.max_ioctl();

    println!("📦 Module Information:");
    println!("======================");
    println!("Name: {}", info.name);
    println!("Description: {}", info.description);
    println!("Version: {} ({})", info.version, info.date);
    println!("Author: {}", info.author);
    println!("License: {}", info.license);
    println!("Compatible: {}", info.compatible.join(", "));
    println!("Aliases: {}", info.aliases.join(", "));
    println!("Features: {:?}", descriptor.features);

    println!("\nIoctls ({}):", descriptor.num_ioctls);
    for desc in descriptor.ioctls {
        println!("  0x{:02x} {:<16} {:?}", desc.nr, desc.name, desc.flags);
    }

    let fops = MALI_DRIVER_FOPS;
    println!("\nFile operations:");
    println!("  open: {:?}", fops.open);
    println!("  release: {:?}", fops.release);
    println!("  unlocked_ioctl: {:?}", fops.unlocked_ioctl);
    println!("  mmap: {:?}", fops.mmap);
    println!("  poll: {:?}", fops.poll);
    if let Some(compat) = fops.compat_ioctl {
        println!("  compat_ioctl: {:?}", compat);
    }
    println!("  llseek: {:?}", fops.llseek);
}

fn print_report_text(report: &SimReport) {
    println!("🔧 Simulation of {}:", if report.board.is_empty() { "board" } else { report.board.as_str() });
    println!("===================");

    if let Some(err) = &report.init_error {
        println!("❌ module init failed: {} ({})", err.message, err.errno);
    }

    for device in &report.devices {
        match (&device.outcome, &device.error) {
            (_, Some(err)) => println!("❌ {}: {} ({})", device.device, err.message, err.errno),
            (Some(outcome), None) => println!("• {}: {:?}", device.device, outcome),
            (None, None) => println!("• {}: no result", device.device),
        }
    }

    for session in &report.sessions {
        println!("\nMinor {}:", session.minor);
        for client in &session.clients {
            let file = client
                .file
                .map(|f| f.to_string())
                .unwrap_or_else(|| "(not opened)".to_string());
            let handles: Vec<String> = client.handles.iter().map(|h| h.to_string()).collect();
            println!(
                "  {}{} handles [{}]",
                file,
                if client.master { " (master)" } else { "" },
                handles.join(", ")
            );
            for err in &client.errors {
                println!("    ❌ {} ({})", err.message, err.errno);
            }
        }
        println!("  objects left after close: {}", session.objects_after_close);
    }

    println!("\nHost events: {}", report.events.len());
    println!(
        "Allocations: {} made, {} released, {} live",
        report.alloc.allocated, report.alloc.released, report.alloc.live
    );
}
