//! Console presentation: the photo's size and each model output on its own line.

use std::fmt::Write as _;

use serde_json::json;
use vision::{PipelineError, Presentation, ResultSink};

pub struct ConsoleSink {
    fields: Vec<String>,
    json: bool,
}

impl ConsoleSink {
    /// `fields` fixes the order outputs are printed in.
    pub fn new(fields: Vec<String>, json: bool) -> Self {
        Self { fields, json }
    }
}

impl ResultSink for ConsoleSink {
    fn present(&mut self, presentation: &Presentation) {
        if self.json {
            println!("{}", render_json(presentation));
        } else {
            print!("{}", render_text(&self.fields, presentation));
        }
    }

    fn capture_failed(&mut self, error: &PipelineError) {
        eprintln!("Nothing captured ({}): {error}. Try again.", error.kind());
    }
}

pub fn render_text(fields: &[String], presentation: &Presentation) -> String {
    let mut out = String::new();
    match &presentation.image {
        Some(image) => {
            let _ = writeln!(out, "Image {}x{}", image.width(), image.height());
        }
        None => out.push_str("Nil image\n"),
    }
    if let Some(inference) = &presentation.inference {
        for field in fields {
            if let Some(value) = inference.get(field) {
                let _ = writeln!(out, "{field} {value:?}");
            }
        }
    }
    out
}

pub fn render_json(presentation: &Presentation) -> serde_json::Value {
    json!({
        "image": presentation.image.as_ref().map(|image| json!({
            "width": image.width(),
            "height": image.height(),
        })),
        "inference": presentation.inference,
    })
}
