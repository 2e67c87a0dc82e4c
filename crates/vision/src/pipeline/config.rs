//! Configuration parsing for the capture pipeline.
//!
//! CLI arguments are translated once into a `PipelineConfig`; the capture
//! session and the frame converter both read the same `CaptureFormat` from it.

use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::{CaptureFormat, FacingPreference, PixelFormat};

/// Bundle shipped next to the binary when `--model` is not given.
pub const DEFAULT_BUNDLE: &str = "resources/phenomenal-face.tiobundle";
/// Output schema the console presentation expects.
pub const DEFAULT_OUTPUTS: [&str; 4] = ["Weight", "Height", "Age", "Sex"];

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 10_000;

/// Where photos come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraSource {
    /// Whatever camera backend the build provides.
    Auto,
    /// OpenCV device index, `/dev/videoN` path, file or URL.
    Device(String),
    /// Software camera serving the image at this path.
    Virtual(PathBuf),
}

impl FromStr for CameraSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("camera source must not be empty");
        }
        if value.eq_ignore_ascii_case("auto") {
            return Ok(CameraSource::Auto);
        }
        if let Some(path) = value.strip_prefix("virtual:") {
            if path.is_empty() {
                bail!("virtual source needs an image path, e.g. virtual:face.jpg");
            }
            return Ok(CameraSource::Virtual(PathBuf::from(path)));
        }
        Ok(CameraSource::Device(value.to_string()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Lower the default log filter to `debug`.
    pub verbose: bool,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    pub source: CameraSource,
    pub facing: FacingPreference,
    /// Photo output contract: what the session produces and the converter accepts.
    pub capture_format: CaptureFormat,
    pub model_path: PathBuf,
    /// Output names the bundle must declare.
    pub expected_outputs: Vec<String>,
    /// Longest wait for the hardware to deliver a requested photo.
    pub capture_timeout: Duration,
    /// Longest wait for conversion plus one forward pass.
    pub inference_timeout: Duration,
    pub telemetry: TelemetryOptions,
}

/// Arguments shared by every subcommand that drives the pipeline.
#[derive(Debug, Args)]
pub struct PipelineCliArgs {
    /// Camera source: `auto`, an OpenCV device index/path, or `virtual:<image>`.
    #[arg(long = "source", value_name = "SOURCE", default_value = "auto")]
    pub source: String,
    /// Preferred camera facing: front, back or any.
    #[arg(long = "facing", value_name = "FACING", default_value = "front")]
    pub facing: String,
    /// Photo pixel format (bgr8, rgb8, bgra8, rgba8, jpeg).
    #[arg(long = "format", value_name = "FORMAT", default_value = "bgr8")]
    pub format: String,
    /// Photo width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Photo height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Model bundle directory (.tiobundle).
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Comma separated output names the bundle must declare.
    #[arg(long = "outputs", value_name = "NAMES", value_delimiter = ',')]
    pub outputs: Vec<String>,
    /// Capture timeout in milliseconds.
    #[arg(long = "capture-timeout-ms", value_name = "MS")]
    pub capture_timeout_ms: Option<u64>,
    /// Conversion plus inference timeout in milliseconds.
    #[arg(long = "inference-timeout-ms", value_name = "MS")]
    pub inference_timeout_ms: Option<u64>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Expose Prometheus metrics on this address (e.g. 127.0.0.1:9000).
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<PipelineCliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineCliArgs) -> Result<Self> {
        let source: CameraSource = args.source.parse()?;
        let facing: FacingPreference = args.facing.parse().map_err(|err: String| anyhow!(err))?;
        let pixel_format: PixelFormat = args.format.parse().map_err(|err: String| anyhow!(err))?;
        if pixel_format == PixelFormat::Gray8 {
            bail!("--format gray8 cannot feed a colour model; use bgr8, rgb8 or jpeg");
        }

        let width = args.width.unwrap_or(DEFAULT_WIDTH);
        let height = args.height.unwrap_or(DEFAULT_HEIGHT);
        if width == 0 || height == 0 {
            bail!("Capture width and height must be positive integers");
        }

        let expected_outputs = if args.outputs.is_empty() {
            DEFAULT_OUTPUTS.iter().map(|name| name.to_string()).collect()
        } else {
            let names: Vec<String> = args
                .outputs
                .iter()
                .map(|name| name.trim().to_string())
                .collect();
            if names.iter().any(String::is_empty) {
                bail!("--outputs must not contain empty names");
            }
            let unique: HashSet<&str> = names.iter().map(String::as_str).collect();
            if unique.len() != names.len() {
                bail!("--outputs must not repeat a name");
            }
            names
        };

        let capture_timeout_ms = args
            .capture_timeout_ms
            .unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS);
        let inference_timeout_ms = args
            .inference_timeout_ms
            .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS);
        if capture_timeout_ms == 0 || inference_timeout_ms == 0 {
            bail!("Timeouts must be at least 1 ms");
        }

        Ok(Self {
            source,
            facing,
            capture_format: CaptureFormat::new(pixel_format, width, height),
            model_path: resolve_model_path(args.model),
            expected_outputs,
            capture_timeout: Duration::from_millis(capture_timeout_ms),
            inference_timeout: Duration::from_millis(inference_timeout_ms),
            telemetry: TelemetryOptions {
                verbose: args.verbose,
                metrics_addr: args.metrics_addr,
            },
        })
    }
}

/// Explicit path, else the bundle next to the executable, else relative to
/// the working directory.
pub fn resolve_model_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let beside_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_BUNDLE)));
    match beside_exe {
        Some(path) if path.is_dir() => path,
        _ => Path::new(DEFAULT_BUNDLE).to_path_buf(),
    }
}
