use std::{
    io::{self, BufRead},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{TryRecvError, unbounded};
use serde_json::json;
use tracing::{debug, info, warn};
use video_ingest::{DeviceRegistry, FacingPreference};
use vision::{
    CameraSource, FeatureStatus, Pipeline, PipelineCliArgs, PipelineConfig, PipelineEvent,
    TelemetryOptions, pipeline::source, telemetry,
};

use crate::sink::ConsoleSink;

/// Interval between pipeline pumps in interactive mode.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(
    name = "snapcam",
    version,
    about = "Capture a still photo and run the bundled model on it"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List capture devices and mark the one that would be used.
    Devices(DevicesArgs),
    /// Take one photo, run the model and print the outputs.
    Capture {
        #[command(flatten)]
        pipeline: PipelineCliArgs,
        /// Print the presentation as JSON.
        #[arg(long = "json", action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Press Enter to capture, `q` to quit.
    Interactive {
        #[command(flatten)]
        pipeline: PipelineCliArgs,
    },
}

#[derive(Debug, Args)]
struct DevicesArgs {
    /// Camera source: `auto`, an OpenCV device index/path, or `virtual:<image>`.
    #[arg(long = "source", value_name = "SOURCE", default_value = "auto")]
    source: String,
    /// Preferred camera facing: front, back or any.
    #[arg(long = "facing", value_name = "FACING", default_value = "front")]
    facing: String,
    /// Print devices as JSON.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    json: bool,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Devices(args) => list_devices(args),
        Command::Capture { pipeline, json } => capture(PipelineConfig::try_from(pipeline)?, json),
        Command::Interactive { pipeline } => interactive(PipelineConfig::try_from(pipeline)?),
    }
}

fn list_devices(args: DevicesArgs) -> Result<()> {
    telemetry::init(&TelemetryOptions {
        verbose: args.verbose,
        metrics_addr: None,
    })?;
    let source: CameraSource = args.source.parse()?;
    let facing: FacingPreference = args.facing.parse().map_err(|err: String| anyhow!(err))?;

    let registry = DeviceRegistry::new(source::camera_backend(&source)?);
    let devices = registry
        .list_devices()
        .context("failed to enumerate capture devices")?;
    let selected = DeviceRegistry::select_preferred(&devices, facing)
        .ok()
        .map(|device| device.id);

    if args.json {
        let listing: Vec<_> = devices
            .iter()
            .map(|device| {
                json!({
                    "id": device.id,
                    "name": device.name,
                    "facing": device.facing.label(),
                    "max_width": device.capabilities.max_width,
                    "max_height": device.capabilities.max_height,
                    "formats": device
                        .capabilities
                        .pixel_formats
                        .iter()
                        .map(|format| format.label())
                        .collect::<Vec<_>>(),
                    "selected": selected.as_deref() == Some(device.id.as_str()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }
    for device in &devices {
        let marker = if selected.as_deref() == Some(device.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let formats: Vec<&str> = device
            .capabilities
            .pixel_formats
            .iter()
            .map(|format| format.label())
            .collect();
        println!(
            "{marker} {:<16} {:<11} {} (up to {}x{}; {})",
            device.id,
            device.facing,
            device.name,
            device.capabilities.max_width,
            device.capabilities.max_height,
            formats.join(", ")
        );
    }
    Ok(())
}

fn capture(config: PipelineConfig, json: bool) -> Result<()> {
    telemetry::init(&config.telemetry)?;
    let sink = ConsoleSink::new(config.expected_outputs.clone(), json);
    let mut pipeline = Pipeline::from_config(&config, Box::new(sink))?;
    report_status(&pipeline, json)?;

    pipeline
        .start()
        .context("failed to start the capture session")?;
    let outcome = pipeline
        .capture_once(config.capture_timeout + config.inference_timeout)
        .map(|_| ());
    pipeline.stop();
    outcome.context("capture failed")?;
    Ok(())
}

fn interactive(config: PipelineConfig) -> Result<()> {
    telemetry::init(&config.telemetry)?;
    let sink = ConsoleSink::new(config.expected_outputs.clone(), false);
    let mut pipeline = Pipeline::from_config(&config, Box::new(sink))?;
    report_status(&pipeline, false)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    let (line_tx, line_rx) = unbounded();
    telemetry::spawn_thread("stdin-reader", move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    })
    .context("failed to spawn stdin reader")?;

    pipeline
        .start()
        .context("failed to start the capture session")?;
    println!("Press Enter to capture, q to quit.");

    'session: while !shutdown.load(Ordering::SeqCst) {
        loop {
            match line_rx.try_recv() {
                Ok(line) => match line.trim() {
                    "q" | "quit" | "exit" => break 'session,
                    _ => match pipeline.trigger() {
                        Ok(request) => debug!(request, "capture triggered"),
                        Err(err) => eprintln!("Capture rejected ({}): {err}", err.kind()),
                    },
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'session,
            }
        }

        match pipeline.pump(PUMP_INTERVAL) {
            Some(PipelineEvent::Presented {
                inference_error: Some(err),
                ..
            }) => eprintln!("No inference for this photo: {err}"),
            Some(PipelineEvent::Discarded { request_id }) => {
                debug!(request = request_id, "stale capture ignored")
            }
            _ => {}
        }
    }

    info!("stopping capture session");
    pipeline.stop();
    Ok(())
}

fn report_status(pipeline: &Pipeline, json: bool) -> Result<()> {
    let status = pipeline.status();
    if let FeatureStatus::Disabled(kind) = status.camera {
        if json {
            println!("{}", json!({ "status": status }));
        }
        bail!("camera unavailable ({kind}); nothing to capture");
    }
    if let FeatureStatus::Disabled(kind) = status.inference {
        eprintln!("Inference disabled ({kind}); photos are shown without results.");
    }
    Ok(())
}
