//! printloom CLI - slice, package and schedule prints on LAN printers
//!
//! `serve` runs the scheduler. The other task and printer commands open the
//! same database directly, so run them while the server is stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use printloom_bambu::{threemf, BambuAdapterFactory, ContainerMetadata};
use printloom_core::{ConnectionConfig, Printer, PrinterProfile, SlicingConfig, TaskId};
use printloom_queue::{logging, AppConfig, PrintService, DEFAULT_STATUS_DEPTH};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "printloom")]
#[command(about = "Slice, package and schedule prints on LAN printers", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, default_value = "printloom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// Slice a model with the configured slicer
    Slice {
        /// Model file (.stl)
        model: PathBuf,
        /// Output toolpath
        #[arg(short, long)]
        output: PathBuf,
        /// Printer profile id
        #[arg(short, long, default_value = "bambu_x1c")]
        profile: String,
        /// Settings preset: fast, standard, high_quality
        #[arg(long, default_value = "standard")]
        preset: String,
    },
    /// Package a toolpath as a .gcode.3mf container
    Wrap {
        /// Toolpath file (.gcode)
        toolpath: PathBuf,
        /// Output container (default: <stem>.gcode.3mf next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Printer model name written into the metadata
        #[arg(long)]
        printer_model: Option<String>,
    },
    /// Extract the toolpath from a .gcode.3mf container
    Unwrap {
        /// Container file
        container: PathBuf,
        /// Output toolpath
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Create a print task and prepare it for the queue
    Submit {
        /// Model file (.stl)
        model: PathBuf,
        /// Target printer id
        #[arg(short, long)]
        printer: String,
        /// Settings preset: fast, standard, high_quality
        #[arg(long, default_value = "standard")]
        preset: String,
        /// Queue priority (higher runs first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show one task, or the queue when no id is given
    Status {
        /// Task id
        id: Option<TaskId>,
    },
    /// Cancel a task
    Cancel {
        /// Task id
        id: TaskId,
    },
    /// List registered printers
    Printers,
    /// Register or update a printer
    Register {
        /// Printer id
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Printer IP address or host name
        #[arg(long)]
        host: String,
        /// Device serial number
        #[arg(long)]
        serial: String,
        /// LAN access code
        #[arg(long)]
        access_code: String,
        /// Printer profile id
        #[arg(long, default_value = "bambu_x1c")]
        profile: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_logging(&config.log_level, config.log_json)?;

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Slice {
            model,
            output,
            profile,
            preset,
        } => slice(&config, &model, &output, &profile, &preset).await?,
        Commands::Wrap {
            toolpath,
            output,
            printer_model,
        } => wrap(&toolpath, output, printer_model)?,
        Commands::Unwrap { container, output } => {
            let payload = threemf::unwrap(&container)?;
            std::fs::write(&output, &payload)?;
            println!("Extracted {} bytes to {}", payload.len(), output.display());
        }
        Commands::Submit {
            model,
            printer,
            preset,
            priority,
        } => submit(&config, &model, &printer, &preset, priority).await?,
        Commands::Status { id } => status(&config, id)?,
        Commands::Cancel { id } => {
            let service = open_service(&config)?;
            let task = service.cancel_task(id).await?;
            println!("Task {} is {}", task.id, task.status);
        }
        Commands::Printers => list_printers(&config)?,
        Commands::Register {
            id,
            name,
            host,
            serial,
            access_code,
            profile,
        } => {
            let profile = find_profile(&profile)?;
            let printer = Printer::new(
                id.clone(),
                name.unwrap_or_else(|| id.clone()),
                profile.name.clone(),
                ConnectionConfig::new(host, serial, access_code),
                profile,
            );
            let service = open_service(&config)?;
            let printer = service.register_printer(printer).await?;
            println!("Registered {} ({})", printer.id, printer.model);
        }
    }

    Ok(())
}

fn open_service(config: &AppConfig) -> Result<PrintService> {
    let factory = Arc::new(BambuAdapterFactory::new(config.printer.adapter_options()));
    PrintService::from_config(config, factory)
}

fn find_profile(id: &str) -> Result<PrinterProfile> {
    PrinterProfile::builtin(id).with_context(|| {
        let known: Vec<String> = PrinterProfile::all_profiles().into_iter().map(|p| p.id).collect();
        format!("unknown profile {id}; known: {}", known.join(", "))
    })
}

async fn serve(config: &AppConfig) -> Result<()> {
    let service = open_service(config)?;
    let shutdown = CancellationToken::new();
    let scheduler = service.start(shutdown.clone()).await?;
    tracing::info!(data_dir = %config.data_dir.display(), "printloom serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    scheduler.await?;
    service.wait_for_workers().await;
    Ok(())
}

async fn slice(
    config: &AppConfig,
    model: &Path,
    output: &Path,
    profile: &str,
    preset: &str,
) -> Result<()> {
    let profile = find_profile(profile)?;
    let settings = SlicingConfig::preset(preset)?;
    let slicer = config.slicer.clone().into_slicer();

    let result = slicer.slice(model, &profile, &settings, output).await?;

    println!("Toolpath: {}", result.output_path.display());
    println!("  Layers:   {}", result.total_layers);
    println!("  Time:     {} min", result.estimated_duration.as_secs() / 60);
    println!("  Material: {:.1} g", result.estimated_material_g);
    if result.estimated {
        println!("  (some statistics were estimated)");
    }
    Ok(())
}

fn wrap(toolpath: &Path, output: Option<PathBuf>, printer_model: Option<String>) -> Result<()> {
    let metadata = ContainerMetadata {
        printer_model,
        ..ContainerMetadata::default()
    };
    let container = match output {
        Some(output) => {
            threemf::wrap_to(toolpath, &output, &metadata)?;
            output
        }
        None => threemf::wrap(toolpath, &metadata)?,
    };
    println!("Wrote {}", container.display());
    Ok(())
}

async fn submit(
    config: &AppConfig,
    model: &Path,
    printer: &str,
    preset: &str,
    priority: i32,
) -> Result<()> {
    let settings = SlicingConfig::preset(preset)?;
    let service = open_service(config)?;
    let model = model.to_string_lossy();

    let id = service.create_task(&model, printer, settings, priority).await?;
    service.wait_for_workers().await;

    let task = service
        .get_task(id)?
        .with_context(|| format!("task {id} disappeared"))?;
    println!("Task {} is {}", task.id, task.status);
    if let Some(position) = task.queue_position {
        println!("  Queue position: {position}");
    }
    if let Some(error) = &task.last_error {
        println!("  Error: {error}");
    }
    Ok(())
}

fn status(config: &AppConfig, id: Option<TaskId>) -> Result<()> {
    let service = open_service(config)?;
    match id {
        Some(id) => {
            let task = service
                .get_task(id)?
                .with_context(|| format!("no task {id}"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        None => {
            let summary = service.queue_summary(DEFAULT_STATUS_DEPTH)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

fn list_printers(config: &AppConfig) -> Result<()> {
    let service = open_service(config)?;
    let printers = service.list_printers()?;
    if printers.is_empty() {
        println!("No printers registered");
        return Ok(());
    }
    for printer in printers {
        let task = printer
            .current_task_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:<24} {:<16} {:<8} {}",
            printer.id, printer.name, printer.connection.host, printer.status, task
        );
    }
    Ok(())
}
