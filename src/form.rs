//! Request parsing (multipart form or JSON) and field validation for the
//! HTTP surface.

use std::collections::HashMap;

use axum::extract::Multipart;
use serde::Deserialize;

use crate::config::Config;
use crate::error::SiftError;
use crate::summarize::pipeline::{Mode, SummarizeOptions};

/// Largest accepted `max_output_tokens`.
pub const MAX_OUTPUT_TOKENS: u32 = 4096;

/// Uploaded file as received, before extraction.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Defaults applied to fields the client leaves out.
#[derive(Debug, Clone)]
pub struct FormDefaults {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub max_input_chars: usize,
    pub max_input_chars_limit: usize,
}

impl FormDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.backend.default_model.clone(),
            temperature: config.pipeline.default_temperature,
            top_p: config.pipeline.default_top_p,
            max_output_tokens: config.pipeline.default_max_output_tokens,
            max_input_chars: config.pipeline.default_max_input_chars,
            max_input_chars_limit: config.pipeline.max_input_chars_limit,
        }
    }
}

impl Default for FormDefaults {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A multipart body split into the `file` part and plain text fields.
#[derive(Debug, Default)]
pub struct FormParts {
    pub upload: Option<Upload>,
    pub fields: HashMap<String, String>,
}

impl FormParts {
    pub async fn read(mut multipart: Multipart) -> Result<Self, SiftError> {
        let mut parts = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| SiftError::Validation(format!("malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| SiftError::Validation(format!("failed to read upload: {e}")))?;
                parts.upload = Some(Upload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| SiftError::Validation(format!("failed to read field {name}: {e}")))?;
                parts.fields.insert(name, value);
            }
        }
        Ok(parts)
    }

    /// The uploaded `.txt` file, or a validation error.
    pub fn take_upload(&mut self) -> Result<Upload, SiftError> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| SiftError::Validation("file is required".to_string()))?;
        validate_filename(&upload.filename)?;
        Ok(upload)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn flag(&self, name: &str, default: bool) -> Result<bool, SiftError> {
        self.get(name).map_or(Ok(default), |v| parse_bool(name, v))
    }

    /// Validated pipeline options, defaults filled in.
    pub fn summarize_options(&self, defaults: &FormDefaults) -> Result<SummarizeOptions, SiftError> {
        OptionFields {
            model: self.get("model").map(str::to_string),
            mode: self.get("mode").map(str::to_string),
            temperature: self.number("temperature")?,
            top_p: self.number("top_p")?,
            max_output_tokens: self.number("max_output_tokens")?,
            max_input_chars: self.number("max_input_chars")?,
        }
        .resolve(defaults)
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, SiftError> {
        self.get(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| SiftError::Validation(format!("{name} must be a number, got {raw}")))
            })
            .transpose()
    }
}

/// Optional summarization knobs as sent by a client, before defaults.
#[derive(Debug, Clone, Default)]
pub struct OptionFields {
    pub model: Option<String>,
    pub mode: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u32>,
    pub max_input_chars: Option<usize>,
}

impl OptionFields {
    pub fn resolve(self, defaults: &FormDefaults) -> Result<SummarizeOptions, SiftError> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| defaults.model.clone());
        validate_model(&model)?;

        let mode = match self.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            Some(raw) => Mode::parse(raw).ok_or_else(|| {
                SiftError::Validation(format!(
                    "mode must be one of bulleted, plain, structured, got {raw}"
                ))
            })?,
            None => Mode::Bulleted,
        };

        let temperature = self.temperature.unwrap_or(defaults.temperature);
        validate_temperature(temperature)?;
        let top_p = self.top_p.unwrap_or(defaults.top_p);
        validate_top_p(top_p)?;
        let max_output_tokens = self.max_output_tokens.unwrap_or(defaults.max_output_tokens);
        if !(1..=MAX_OUTPUT_TOKENS).contains(&max_output_tokens) {
            return Err(SiftError::Validation(format!(
                "max_output_tokens must be between 1 and {MAX_OUTPUT_TOKENS}, got {max_output_tokens}"
            )));
        }
        let max_input_chars = self.max_input_chars.unwrap_or(defaults.max_input_chars);
        if !(1..=defaults.max_input_chars_limit).contains(&max_input_chars) {
            return Err(SiftError::Validation(format!(
                "max_input_chars must be between 1 and {}, got {max_input_chars}",
                defaults.max_input_chars_limit
            )));
        }

        Ok(SummarizeOptions {
            model,
            mode,
            temperature,
            top_p,
            max_output_tokens,
            max_input_chars,
        })
    }
}

/// JSON body of `POST /api/summarize`: raw text plus the same knobs as the
/// upload form.
#[derive(Debug, Clone, Deserialize)]
pub struct TextRequest {
    pub text: String,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u32>,
    #[serde(alias = "max_chars")]
    pub max_input_chars: Option<usize>,
}

impl TextRequest {
    pub fn into_parts(self) -> (String, OptionFields) {
        let fields = OptionFields {
            model: self.model,
            mode: self.mode,
            temperature: self.temperature,
            top_p: self.top_p,
            max_output_tokens: self.max_output_tokens,
            max_input_chars: self.max_input_chars,
        };
        (self.text, fields)
    }
}

pub fn validate_filename(filename: &str) -> Result<(), SiftError> {
    let is_txt = filename
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("txt"));
    if !is_txt {
        return Err(SiftError::Validation(format!(
            "only .txt files are supported, got {filename:?}"
        )));
    }
    Ok(())
}

pub fn validate_model(model: &str) -> Result<(), SiftError> {
    if model.trim().is_empty() {
        return Err(SiftError::Validation("model must not be empty".to_string()));
    }
    Ok(())
}

pub fn validate_temperature(t: f64) -> Result<(), SiftError> {
    if t.is_nan() || t.is_infinite() || !(0.0..=2.0).contains(&t) {
        return Err(SiftError::Validation(format!(
            "temperature must be between 0.0 and 2.0, got {t}"
        )));
    }
    Ok(())
}

pub fn validate_top_p(p: f64) -> Result<(), SiftError> {
    if p.is_nan() || p <= 0.0 || p > 1.0 {
        return Err(SiftError::Validation(format!(
            "top_p must be in (0.0, 1.0], got {p}"
        )));
    }
    Ok(())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, SiftError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SiftError::Validation(format!(
            "{name} must be true or false, got {raw}"
        ))),
    }
}
