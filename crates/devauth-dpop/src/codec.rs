//! Byte codecs: base64url (no padding) and DER-to-raw ECDSA signature conversion.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD, engine::general_purpose::STANDARD};
use thiserror::Error;

/// Errors produced by the byte codecs.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Input bytes did not decode as valid base64 in any tolerated variant.
    #[error("invalid base64 input")]
    InvalidBase64,
    /// DER structure did not match the expected ECDSA-Sig-Value shape.
    #[error("invalid DER signature format: {reason}")]
    InvalidFormat {
        /// What was wrong with the input.
        reason: String,
    },
}

/// Encode bytes as unpadded base64url.
#[must_use]
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode unpadded (or padded) base64url bytes.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|_| CodecError::InvalidBase64)
}

/// Decode a nonce that may arrive as base64url, standard base64, or raw UTF-8 bytes.
///
/// Tried in that order; the first variant that decodes successfully wins. Raw UTF-8 always
/// "succeeds", so it is the fallback of last resort.
#[must_use]
pub fn decode_nonce_lenient(input: &str) -> Vec<u8> {
    if let Ok(bytes) = base64url_decode(input) {
        return bytes;
    }
    if let Ok(bytes) = STANDARD.decode(input) {
        return bytes;
    }
    input.as_bytes().to_vec()
}

const COORD_OCTET_LEN: usize = 32;

/// Convert a DER-encoded ECDSA-Sig-Value (`SEQUENCE { r INTEGER, s INTEGER }`) to fixed-width
/// raw `r‖s` bytes, each zero-padded to `COORD_OCTET_LEN`.
pub fn der_to_raw_ecdsa(der: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut cursor = DerCursor::new(der);
    cursor.expect_tag(0x30, "outer SEQUENCE")?;
    let seq_len = cursor.read_length()?;
    let seq_end = cursor.pos + seq_len;
    if seq_end != der.len() {
        return Err(CodecError::InvalidFormat {
            reason: "outer SEQUENCE length does not consume the entire input".into(),
        });
    }

    let r = cursor.read_integer()?;
    let s = cursor.read_integer()?;

    if cursor.pos != seq_end {
        return Err(CodecError::InvalidFormat {
            reason: "trailing bytes after two INTEGER components".into(),
        });
    }

    let mut raw = Vec::with_capacity(COORD_OCTET_LEN * 2);
    raw.extend(left_pad(&r, COORD_OCTET_LEN)?);
    raw.extend(left_pad(&s, COORD_OCTET_LEN)?);
    Ok(raw)
}

fn left_pad(component: &[u8], width: usize) -> Result<[u8; COORD_OCTET_LEN], CodecError> {
    // A single leading 0x00 sign byte is expected for INTEGERs whose high bit would
    // otherwise be mistaken for a negative number; strip at most one.
    let trimmed = if component.len() == width + 1 && component[0] == 0x00 {
        &component[1..]
    } else {
        component
    };
    if trimmed.len() > width {
        return Err(CodecError::InvalidFormat {
            reason: format!("integer component longer than {width} bytes"),
        });
    }
    let mut out = [0u8; COORD_OCTET_LEN];
    out[width - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

/// Minimal DER cursor, just enough to parse `ECDSA-Sig-Value ::= SEQUENCE { r, s INTEGER }`.
struct DerCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect_tag(&mut self, tag: u8, what: &str) -> Result<(), CodecError> {
        match self.data.get(self.pos) {
            Some(&b) if b == tag => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(CodecError::InvalidFormat {
                reason: format!("expected {what} tag 0x{tag:02x}"),
            }),
        }
    }

    fn read_length(&mut self) -> Result<usize, CodecError> {
        let first = *self.data.get(self.pos).ok_or_else(|| CodecError::InvalidFormat {
            reason: "truncated length octet".into(),
        })?;
        self.pos += 1;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let num_octets = (first & 0x7f) as usize;
        if num_octets == 0 || num_octets > 4 {
            return Err(CodecError::InvalidFormat {
                reason: "unsupported long-form length encoding".into(),
            });
        }
        let bytes = self
            .data
            .get(self.pos..self.pos + num_octets)
            .ok_or_else(|| CodecError::InvalidFormat {
                reason: "truncated long-form length".into(),
            })?;
        self.pos += num_octets;
        let mut len = 0usize;
        for b in bytes {
            len = (len << 8) | (*b as usize);
        }
        Ok(len)
    }

    fn read_integer(&mut self) -> Result<Vec<u8>, CodecError> {
        self.expect_tag(0x02, "INTEGER")?;
        let len = self.read_length()?;
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| CodecError::InvalidFormat {
                reason: "truncated INTEGER contents".into(),
            })?;
        self.pos += len;
        Ok(bytes.to_vec())
    }
}
