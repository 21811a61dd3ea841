//! Inbound frame decoding and outbound encoding.
//!
//! Text frames carry exactly one JSON [`TextMessage`]. Binary frames carry a
//! [`ContentMessage`] plus one blob per declared filename, in one of two
//! envelopes:
//!
//! ```text
//! delimited:       <json>^~~^<blob-1>^$_$^<blob-2>...
//! length-prefixed: [u32 BE json len][json][u32 BE blob count]([u32 BE len][blob])*
//! ```
//!
//! The delimited form is what existing clients speak. Its separators can in
//! principle occur inside a blob, so new clients should use the
//! length-prefixed form.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::Serialize;

use parley_types::events::{ContentMessage, OutboundMessage, TextMessage};
use parley_types::models::ContentKind;

/// Splits the JSON metadata from the blob section in delimited frames.
pub const BINARY_SEPARATOR: &[u8] = b"^~~^";

/// Splits consecutive blobs in delimited frames.
pub const FILE_SEPARATOR: &[u8] = b"^$_$^";

const LEN_PREFIX: usize = 4;

/// Binary envelope spoken on a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    #[default]
    LengthPrefixed,
    Delimited,
}

impl FromStr for FrameFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "length-prefixed" => Ok(Self::LengthPrefixed),
            "delimited" => Ok(Self::Delimited),
            other => Err(format!("unknown frame format '{}'", other)),
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LengthPrefixed => "length-prefixed",
            Self::Delimited => "delimited",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body must only have a single value")]
    TrailingData,

    /// Wrong number of top-level parts, or a length prefix that runs past the frame.
    #[error("payload not formatted correctly")]
    IncorrectLength,

    #[error("{segments} attachments for {filenames} filenames")]
    SegmentCount { segments: usize, filenames: usize },
}

/// A decoded frame ready for dispatch.
#[derive(Debug, Clone)]
pub enum Inbound {
    Text(TextMessage),
    Content {
        message: ContentMessage,
        /// One blob per `message.filenames` entry, same order.
        segments: Vec<Bytes>,
    },
}

impl Inbound {
    pub fn content_kind(&self) -> ContentKind {
        match self {
            Self::Text(_) => ContentKind::Text,
            Self::Content { message, .. } => message.content_kind,
        }
    }
}

pub fn decode_text(payload: &str) -> Result<TextMessage, DecodeError> {
    let mut values = serde_json::Deserializer::from_str(payload).into_iter::<TextMessage>();
    let message = match values.next() {
        Some(message) => message?,
        None => return Err(DecodeError::Empty),
    };
    if values.next().is_some() {
        return Err(DecodeError::TrailingData);
    }
    Ok(message)
}

pub fn decode_binary(
    format: FrameFormat,
    data: &Bytes,
) -> Result<(ContentMessage, Vec<Bytes>), DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (message, segments) = match format {
        FrameFormat::Delimited => decode_delimited(data)?,
        FrameFormat::LengthPrefixed => decode_length_prefixed(data)?,
    };

    if segments.len() != message.filenames.len() {
        return Err(DecodeError::SegmentCount {
            segments: segments.len(),
            filenames: message.filenames.len(),
        });
    }
    Ok((message, segments))
}

fn decode_delimited(data: &Bytes) -> Result<(ContentMessage, Vec<Bytes>), DecodeError> {
    let parts = split_bytes(data, BINARY_SEPARATOR);
    let [meta, blobs] = parts.as_slice() else {
        return Err(DecodeError::IncorrectLength);
    };

    let message: ContentMessage = serde_json::from_slice(meta)?;
    Ok((message, split_bytes(blobs, FILE_SEPARATOR)))
}

fn decode_length_prefixed(data: &Bytes) -> Result<(ContentMessage, Vec<Bytes>), DecodeError> {
    let mut pos = 0;
    let meta = take_prefixed(data, &mut pos)?;
    let message: ContentMessage = serde_json::from_slice(&meta)?;

    let count = read_u32(data, &mut pos)? as usize;
    // Each blob needs at least its own prefix, so a larger count cannot be honest.
    if count > (data.len() - pos) / LEN_PREFIX {
        return Err(DecodeError::IncorrectLength);
    }

    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        segments.push(take_prefixed(data, &mut pos)?);
    }
    if pos != data.len() {
        return Err(DecodeError::IncorrectLength);
    }
    Ok((message, segments))
}

fn read_u32(data: &Bytes, pos: &mut usize) -> Result<u32, DecodeError> {
    let end = pos.checked_add(LEN_PREFIX).ok_or(DecodeError::IncorrectLength)?;
    let raw = data.get(*pos..end).ok_or(DecodeError::IncorrectLength)?;
    let mut buf = [0u8; LEN_PREFIX];
    buf.copy_from_slice(raw);
    *pos = end;
    Ok(u32::from_be_bytes(buf))
}

fn take_prefixed(data: &Bytes, pos: &mut usize) -> Result<Bytes, DecodeError> {
    let len = read_u32(data, pos)? as usize;
    let end = pos.checked_add(len).ok_or(DecodeError::IncorrectLength)?;
    if end > data.len() {
        return Err(DecodeError::IncorrectLength);
    }
    let out = data.slice(*pos..end);
    *pos = end;
    Ok(out)
}

/// Split on every occurrence of `sep`; `n` separators always give `n + 1` parts.
fn split_bytes(data: &Bytes, sep: &[u8]) -> Vec<Bytes> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + sep.len() <= data.len() {
        if &data[i..i + sep.len()] == sep {
            parts.push(data.slice(start..i));
            i += sep.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(data.slice(start..));
    parts
}

/// Build a delimited binary frame. Blobs are written verbatim.
pub fn encode_delimited<B: AsRef<[u8]>>(
    message: &ContentMessage,
    blobs: &[B],
) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(message)?;
    out.extend_from_slice(BINARY_SEPARATOR);
    for (i, blob) in blobs.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(FILE_SEPARATOR);
        }
        out.extend_from_slice(blob.as_ref());
    }
    Ok(out)
}

/// Build a length-prefixed binary frame.
pub fn encode_length_prefixed<B: AsRef<[u8]>>(
    message: &ContentMessage,
    blobs: &[B],
) -> Result<Vec<u8>, serde_json::Error> {
    let meta = serde_json::to_vec(message)?;
    let blob_bytes: usize = blobs.iter().map(|b| b.as_ref().len()).sum();
    let total = LEN_PREFIX * (2 + blobs.len()) + meta.len() + blob_bytes;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(&(blobs.len() as u32).to_be_bytes());
    for blob in blobs {
        let blob = blob.as_ref();
        out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        out.extend_from_slice(blob);
    }
    Ok(out)
}

/// Build a binary frame in whichever envelope `format` names.
pub fn encode_binary<B: AsRef<[u8]>>(
    format: FrameFormat,
    message: &ContentMessage,
    blobs: &[B],
) -> Result<Vec<u8>, serde_json::Error> {
    match format {
        FrameFormat::Delimited => encode_delimited(message, blobs),
        FrameFormat::LengthPrefixed => encode_length_prefixed(message, blobs),
    }
}

/// Outbound messages always travel as a single JSON text frame.
pub fn encode_outbound(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    encode_json(message)
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}
