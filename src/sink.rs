//! Persisting decoded envelopes as JSON artifacts
//!
//! One file per message: `YYYYMMDD_HHMMSS_ffffff_{request|response}.json`.
//! MessagePack is richer than JSON, so values are flattened on the way out:
//! - binary: UTF-8 text when valid, otherwise `b64:` + standard base64
//! - map keys: strings as-is, other keys as their compact text; a repeated
//!   key keeps its last value
//! - ext: `[type, data]`
//! - NaN / infinity: `null`

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Local};
use rmpv::Value;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::channel::MessageKind;
use crate::envelope::DecodedEnvelope;

/// Prefix marking a base64-rendered binary leaf
pub const BASE64_MARKER: &str = "b64:";

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot create dump directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("cannot write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for decoded messages
pub trait PersistenceSink: Send {
    /// Store one decoded message, returning where it went
    fn persist(&mut self, kind: MessageKind, envelope: &DecodedEnvelope) -> Result<PathBuf, SinkError>;
}

/// Writes one pretty-printed JSON file per message into a directory
#[derive(Debug, Clone)]
pub struct DumpDirSink {
    dir: PathBuf,
}

impl DumpDirSink {
    /// Create the directory if needed
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| SinkError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(DumpDirSink { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create_unique(&self, stem: &str) -> Result<(PathBuf, File), SinkError> {
        let mut attempt = 0;
        loop {
            let name = match attempt {
                0 => format!("{}.json", stem),
                n => format!("{}_{}.json", stem, n),
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(source) => return Err(SinkError::Write { path, source }),
            }
        }
    }
}

impl PersistenceSink for DumpDirSink {
    fn persist(&mut self, kind: MessageKind, envelope: &DecodedEnvelope) -> Result<PathBuf, SinkError> {
        let stem = artifact_stem(Local::now(), kind);
        let (path, file) = self.create_unique(&stem)?;

        let json = to_json(envelope.value());
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &json)?;
        writer
            .flush()
            .map_err(|source| SinkError::Write { path: path.clone(), source })?;

        tracing::debug!(path = %path.display(), "persisted {}", kind);
        Ok(path)
    }
}

/// `20240131_235959_123456_request`
pub fn artifact_stem(at: DateTime<Local>, kind: MessageKind) -> String {
    format!("{}_{}", at.format("%Y%m%d_%H%M%S_%6f"), kind.as_str())
}

/// Render a binary leaf as text
pub fn render_binary(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("{}{}", BASE64_MARKER, STANDARD.encode(bytes)),
    }
}

/// Convert a MessagePack value into its JSON rendering
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Integer(i) => {
            if let Some(n) = i.as_u64() {
                JsonValue::Number(n.into())
            } else if let Some(n) = i.as_i64() {
                JsonValue::Number(n.into())
            } else {
                JsonValue::Null
            }
        }
        Value::F32(f) => float(f64::from(*f)),
        Value::F64(f) => float(*f),
        Value::String(s) => match s.as_str() {
            Some(text) => JsonValue::String(text.to_string()),
            None => JsonValue::String(render_binary(s.as_bytes())),
        },
        Value::Binary(bytes) => JsonValue::String(render_binary(bytes)),
        Value::Array(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, value) in entries {
                object.insert(key_text(key), to_json(value));
            }
            JsonValue::Object(object)
        }
        Value::Ext(ty, data) => JsonValue::Array(vec![
            JsonValue::Number((*ty).into()),
            JsonValue::String(render_binary(data)),
        ]),
    }
}

fn float(f: f64) -> JsonValue {
    Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

fn key_text(key: &Value) -> String {
    match to_json(key) {
        JsonValue::String(text) => text,
        other => other.to_string(),
    }
}
