//! Display references for faces and photos.
//!
//! Object keys are percent-encoded when placed in a reference, so keys with
//! spaces, `&`, `?`, `#` or `%` come back out of [`photo_key`] unchanged.

use crate::types::FaceId;
use std::fmt::Write;

const FACE_HANDLE: &str = "facetag://faces/";
const PHOTO_HANDLE: &str = "facetag://photos/";
const FACE_QUERY: &str = "/?face=";
const PHOTO_QUERY: &str = "/photo/?photo=";

/// Builds the display references handed to the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links {
    gateway: Option<String>,
}

impl Links {
    /// `gateway` is a host (`api.example.net`) or a base URL. `None` yields
    /// `facetag://` handles the CLI resolves through the daemon.
    pub fn new(gateway: Option<&str>) -> Self {
        let gateway = gateway
            .map(|g| g.trim().trim_end_matches('/'))
            .filter(|g| !g.is_empty())
            .map(|g| {
                if g.starts_with("http://") || g.starts_with("https://") {
                    g.to_string()
                } else {
                    format!("https://{g}")
                }
            });
        Self { gateway }
    }

    pub fn face_url(&self, face_id: &FaceId) -> String {
        let key = encode_key(&face_id.object_key());
        match &self.gateway {
            Some(base) => format!("{base}{FACE_QUERY}{key}"),
            None => format!("{FACE_HANDLE}{key}"),
        }
    }

    pub fn photo_url(&self, image_id: &str) -> String {
        let key = encode_key(image_id);
        match &self.gateway {
            Some(base) => format!("{base}{PHOTO_QUERY}{key}"),
            None => format!("{PHOTO_HANDLE}{key}"),
        }
    }
}

/// Photo key carried by a reference from [`Links::photo_url`].
pub fn photo_key(url: &str) -> Option<String> {
    let encoded = url
        .strip_prefix(PHOTO_HANDLE)
        .or_else(|| url.split_once(PHOTO_QUERY).map(|(_, key)| key))?;
    decode_key(encoded).filter(|key| !key.is_empty())
}

fn keeps_literal(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/')
}

/// Percent-encode every byte outside the unreserved set. `/` is kept so
/// nested keys stay readable.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if keeps_literal(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Inverse of [`encode_key`]. `None` on a truncated or non-hex escape, or
/// when the decoded bytes are not UTF-8.
pub fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
