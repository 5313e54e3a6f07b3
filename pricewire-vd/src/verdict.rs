//! Model verdict parsing
//!
//! Models are asked for a strict JSON object but routinely wrap it in
//! prose or code fences. The parser locates the first balanced `{…}`
//! (string- and escape-aware), validates the required fields, and rejects
//! anything else. No schema-guided repair is attempted.

use pricewire_common::models::GlitchType;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerdictError {
    #[error("no JSON object in model output")]
    NoJsonObject,

    #[error("invalid verdict JSON: {0}")]
    InvalidJson(String),
}

/// Parsed and normalized model verdict
#[derive(Debug, Clone)]
pub struct ModelVerdict {
    pub is_glitch: bool,
    /// Clamped to [0,100]
    pub confidence: f64,
    pub reasoning: String,
    pub glitch_type: GlitchType,
}

#[derive(Deserialize)]
struct RawVerdict {
    is_glitch: bool,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    glitch_type: Option<String>,
}

/// Parse a model response into a verdict.
///
/// `is_glitch` must be a real boolean and `confidence` a number; a missing
/// `glitch_type` or one outside the known set maps to `unknown`.
pub fn parse_verdict(raw: &str) -> Result<ModelVerdict, VerdictError> {
    let json = extract_json_object(raw).ok_or(VerdictError::NoJsonObject)?;
    let parsed: RawVerdict =
        serde_json::from_str(json).map_err(|e| VerdictError::InvalidJson(e.to_string()))?;

    let glitch_type = parsed
        .glitch_type
        .as_deref()
        .map(|s| GlitchType::from_str(s).unwrap_or(GlitchType::Unknown))
        .unwrap_or(GlitchType::Unknown);

    Ok(ModelVerdict {
        is_glitch: parsed.is_glitch,
        confidence: parsed.confidence.clamp(0.0, 100.0),
        reasoning: parsed.reasoning.unwrap_or_default(),
        glitch_type,
    })
}

/// Locate the first balanced JSON object in `raw`.
///
/// Tracks string context and escape sequences so braces inside string
/// values do not unbalance the scan.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
