//! Self-describing model bundles.
//!
//! A bundle is a directory holding a `model.json` manifest next to the model
//! file it names. The manifest declares one image input and a list of scalar
//! outputs; everything is validated here, once, when the bundle is opened.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::LoadError;

pub const MANIFEST_FILE: &str = "model.json";

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    version: Option<String>,
    model: ModelSection,
    inputs: Vec<InputSection>,
    outputs: Vec<OutputSection>,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    file: String,
    backend: String,
    #[serde(default)]
    quantized: bool,
}

#[derive(Debug, Deserialize)]
struct InputSection {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    shape: Vec<i64>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    normalize: Option<NormalizeSection>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NormalizeSection {
    Standard {
        standard: String,
    },
    ScaleBias {
        scale: f32,
        #[serde(default)]
        bias: Option<BiasSection>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct BiasSection {
    #[serde(default)]
    r: f32,
    #[serde(default)]
    g: f32,
    #[serde(default)]
    b: f32,
}

#[derive(Debug, Deserialize)]
struct OutputSection {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    shape: Vec<i64>,
}

/// Channel order the model expects in its input tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Mapping from a `u8` channel value to the float fed to the model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Normalization {
    /// Raw 0..=255 values.
    None,
    ZeroToOne,
    MinusOneToOne,
    /// `value * scale + bias[channel]`, channels in R, G, B order.
    ScaleBias { scale: f32, bias: [f32; 3] },
}

impl Normalization {
    /// Normalise `value` of channel `channel` (0 = R, 1 = G, 2 = B).
    pub fn apply(self, channel: usize, value: u8) -> f32 {
        let value = value as f32;
        match self {
            Normalization::None => value,
            Normalization::ZeroToOne => value / 255.0,
            Normalization::MinusOneToOne => value / 127.5 - 1.0,
            Normalization::ScaleBias { scale, bias } => value * scale + bias[channel.min(2)],
        }
    }
}

/// The single image input of a bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInputSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub channel_order: ChannelOrder,
    pub normalization: Normalization,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
}

/// Parsed and validated bundle. Immutable once opened.
#[derive(Clone, Debug)]
pub struct ModelBundle {
    root: PathBuf,
    name: String,
    id: Option<String>,
    version: Option<String>,
    backend: String,
    model_file: PathBuf,
    quantized: bool,
    input: ImageInputSpec,
    outputs: Vec<OutputSpec>,
}

impl ModelBundle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(LoadError::Missing { path: root });
        }

        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(LoadError::Missing {
                path: manifest_path,
            });
        }
        let raw = fs::read(&manifest_path).map_err(|source| LoadError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|source| LoadError::Malformed {
                path: manifest_path.clone(),
                source,
            })?;

        let input = parse_input(&manifest.inputs)?;
        let outputs = parse_outputs(&manifest.outputs)?;

        let model_file = root.join(&manifest.model.file);
        if !model_file.is_file() {
            return Err(LoadError::Missing { path: model_file });
        }

        Ok(Self {
            root,
            name: manifest.name,
            id: manifest.id,
            version: manifest.version,
            backend: manifest.model.backend.to_ascii_lowercase(),
            model_file,
            quantized: manifest.model.quantized,
            input,
            outputs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Backend identifier from the manifest, lowercased.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn model_file(&self) -> &Path {
        &self.model_file
    }

    pub fn quantized(&self) -> bool {
        self.quantized
    }

    pub fn input(&self) -> &ImageInputSpec {
        &self.input
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|output| output.name.as_str())
    }
}

fn parse_input(inputs: &[InputSection]) -> Result<ImageInputSpec, LoadError> {
    let [input] = inputs else {
        return Err(LoadError::Schema(format!(
            "expected exactly one input, found {}",
            inputs.len()
        )));
    };
    if input.kind != "image" {
        return Err(LoadError::Schema(format!(
            "input {:?} has type {:?}, expected \"image\"",
            input.name, input.kind
        )));
    }

    let dims = match input.shape.as_slice() {
        [h, w, 3] | [1, h, w, 3] => image_dim(*h).zip(image_dim(*w)),
        _ => None,
    };
    let Some((height, width)) = dims else {
        return Err(LoadError::Schema(format!(
            "input {:?} shape {:?} is not [height, width, 3]",
            input.name, input.shape
        )));
    };

    let channel_order = match input.format.as_deref().map(str::to_ascii_uppercase) {
        None => ChannelOrder::Rgb,
        Some(format) if format == "RGB" => ChannelOrder::Rgb,
        Some(format) if format == "BGR" => ChannelOrder::Bgr,
        Some(format) => {
            return Err(LoadError::Schema(format!(
                "input {:?} pixel format {format:?} is not RGB or BGR",
                input.name
            )));
        }
    };

    let normalization = match &input.normalize {
        None => Normalization::None,
        Some(NormalizeSection::Standard { standard }) => match standard.as_str() {
            "[0,1]" => Normalization::ZeroToOne,
            "[-1,1]" => Normalization::MinusOneToOne,
            other => {
                return Err(LoadError::Schema(format!(
                    "unknown standard normalization {other:?}"
                )));
            }
        },
        Some(NormalizeSection::ScaleBias { scale, bias }) => {
            let bias = bias.as_ref().map(|b| [b.r, b.g, b.b]).unwrap_or_default();
            Normalization::ScaleBias {
                scale: *scale,
                bias,
            }
        }
    };

    Ok(ImageInputSpec {
        name: input.name.clone(),
        width,
        height,
        channel_order,
        normalization,
    })
}

/// A positive image dimension that fits the pixel grid.
fn image_dim(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|&dim| dim > 0)
}

fn parse_outputs(outputs: &[OutputSection]) -> Result<Vec<OutputSpec>, LoadError> {
    if outputs.is_empty() {
        return Err(LoadError::Schema("bundle declares no outputs".into()));
    }
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(outputs.len());
    for output in outputs {
        if output.name.is_empty() {
            return Err(LoadError::Schema("output with empty name".into()));
        }
        if !seen.insert(output.name.as_str()) {
            return Err(LoadError::Schema(format!(
                "duplicate output {:?}",
                output.name
            )));
        }
        if !matches!(output.kind.as_str(), "array" | "scalar") {
            return Err(LoadError::Schema(format!(
                "output {:?} has unsupported type {:?}",
                output.name, output.kind
            )));
        }
        // Scalars only: every declared dimension must be exactly 1.
        if !output.shape.iter().all(|&dim| dim == 1) {
            return Err(LoadError::Schema(format!(
                "output {:?} shape {:?} is not a scalar",
                output.name, output.shape
            )));
        }
        specs.push(OutputSpec {
            name: output.name.clone(),
        });
    }
    Ok(specs)
}
