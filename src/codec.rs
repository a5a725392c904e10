//! Decoding of page records written by the storefront.
//!
//! The shared store holds one opaque value per key. Three forms are seen in
//! practice:
//!
//! - `gz:\x1f\x8b` followed by a zlib stream, the native form written by the
//!   storefront's Redis cache backend;
//! - `gz` followed by base64 of a compressed JSON document, written by
//!   tooling that cannot store binary values;
//! - plain JSON text, which is what anything without the `gz` marker is
//!   taken to be (a leading UTF-8 BOM is skipped).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Leading bytes of the native compressed form.
pub const NATIVE_GZIP_PREFIX: &[u8] = b"gz:\x1f\x8b";
/// Marker shared by both compressed forms.
pub const GZIP_MARKER: &[u8] = b"gz";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Storage form a page was decoded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionTag {
    #[default]
    None,
    Gzip,
}

/// A rendered page as stored by the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPage {
    pub content: String,

    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: BTreeMap<String, String>,

    #[serde(skip)]
    pub compression: CompressionTag,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub minified: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl StoredPage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            headers: BTreeMap::new(),
            compression: CompressionTag::None,
            minified: false,
            status_code: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Headers arrive as an object, or as `[]` when PHP encoded an empty array.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawHeaders {
        Map(BTreeMap<String, Value>),
        List(Vec<Value>),
    }

    let mut headers = BTreeMap::new();
    match Option::<RawHeaders>::deserialize(deserializer)? {
        Some(RawHeaders::Map(map)) => {
            for (name, value) in map {
                if let Some(value) = header_value(value) {
                    headers.insert(name, value);
                }
            }
        }
        Some(RawHeaders::List(lines)) => {
            // "Name: value" lines
            for line in lines {
                if let Value::String(line) = line {
                    if let Some((name, value)) = line.split_once(':') {
                        headers.insert(name.trim().to_owned(), value.trim().to_owned());
                    }
                }
            }
        }
        None => {}
    }
    Ok(headers)
}

fn header_value(value: Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(values) => {
            let joined: Vec<String> = values.into_iter().filter_map(header_value).collect();
            (!joined.is_empty()).then(|| joined.join(", "))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Strategy turning a raw stored value into a page.
pub trait PageCodec: Send + Sync + 'static {
    fn decode(&self, raw: &[u8]) -> Result<StoredPage, DecodeError>;
}

/// Decoder for every form the storefront writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PageCodec for PayloadCodec {
    fn decode(&self, raw: &[u8]) -> Result<StoredPage, DecodeError> {
        let (json, compression): (Cow<'_, [u8]>, _) = if raw.starts_with(NATIVE_GZIP_PREFIX) {
            let inflated = inflate_zlib(&raw[NATIVE_GZIP_PREFIX.len()..])?;
            (Cow::Owned(inflated), CompressionTag::Gzip)
        } else if raw.starts_with(GZIP_MARKER) {
            let body = &raw[GZIP_MARKER.len()..];
            let body = body.strip_prefix(b":").unwrap_or(body);
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|byte| !byte.is_ascii_whitespace())
                .collect();
            let decoded = BASE64
                .decode(compact)
                .map_err(|err| DecodeError::Decompress(format!("invalid base64: {err}")))?;
            (Cow::Owned(inflate(&decoded)?), CompressionTag::Gzip)
        } else {
            let plain = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
            (Cow::Borrowed(plain), CompressionTag::None)
        };

        let mut page: StoredPage =
            serde_json::from_slice(&json).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        page.compression = compression;
        Ok(page)
    }
}

impl PayloadCodec {
    pub fn encode_plain(page: &StoredPage) -> io::Result<Vec<u8>> {
        Ok(serde_json::to_vec(page)?)
    }

    /// `gz` + base64(gzip(json)).
    pub fn encode_gzip_base64(page: &StoredPage) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serde_json::to_vec(page)?)?;
        let compressed = encoder.finish()?;

        let mut out = GZIP_MARKER.to_vec();
        out.extend_from_slice(BASE64.encode(compressed).as_bytes());
        Ok(out)
    }

    /// `gz:\x1f\x8b` + zlib(json), as the storefront's cache backend writes it.
    pub fn encode_native(page: &StoredPage) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serde_json::to_vec(page)?)?;
        let compressed = encoder.finish()?;

        let mut out = NATIVE_GZIP_PREFIX.to_vec();
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        read_all(GzDecoder::new(bytes))
    } else {
        inflate_zlib(bytes)
    }
}

fn inflate_zlib(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    read_all(ZlibDecoder::new(bytes))
}

fn read_all(mut reader: impl Read) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|err| DecodeError::Decompress(err.to_string()))?;
    Ok(out)
}
