#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

#[cfg(feature = "openssl")]
pub mod openssl;

pub mod appearance;
pub mod byte_range;
pub mod dss;
pub mod incremental;
pub mod placement;
pub mod revisions;
pub mod signing;

#[cfg(test)]
mod test_support;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use lopdf::{Object, StringFormat};
use regex::bytes::Regex;
use thiserror::Error;

pub use byte_range::ByteRange;
pub use dss::{
    extend_with_trust_material, Extension, SignatureValidationData, TokenKind, TrustMaterialToken,
};
pub use incremental::IncrementalUpdate;
pub use revisions::{
    parse_revisions, ExcludedRevision, RevisionKind, RevisionReport, SignatureRevision,
};
pub use signing::{
    DigestAlgorithm, ExternalSigner, PdfSignatureService, SignatureFieldParameters, SignatureType,
    SigningParameters,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("document could not be loaded")]
    DocumentLoad(#[source] lopdf::Error),
    #[error("PDF object error")]
    Pdf(#[from] lopdf::Error),
    #[error("inconsistent document structure: {0}")]
    Structural(String),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature value does not match the bytes skipped by its byte range, the incremental update was shifted or rewritten")]
    TamperDetected,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("unsupported appearance: {0}")]
    UnsupportedAppearance(String),
    #[error("image processing error")]
    Image(#[from] image::ImageError),
    #[error("invalid trust material token: {0}")]
    InvalidToken(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("signature field \"{0}\" does not exist")]
    SignatureFieldNotFound(String),
    #[error("signature field \"{0}\" is already signed")]
    SignatureFieldAlreadySigned(String),
    #[error("external callback failed")]
    External(#[source] anyhow::Error),
}

impl Error {
    /// Whether the error aborts the whole operation.
    ///
    /// Non-fatal errors concern a single revision, token or visual element
    /// and are reported next to the partial result instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::MalformedSignature(_)
                | Error::TamperDetected
                | Error::UnsupportedAppearance(_)
                | Error::Image(_)
                | Error::InvalidToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Verifies a signature value against the two signed segments of a document.
///
/// Implemented by the optional [`openssl`] module, but any cryptographic
/// backend can be plugged in.
pub trait SignatureVerifier {
    /// Whatever the verifier wants to give back about a valid signature.
    type Return;

    fn verify(&self, signature: &[u8], signed_data: [&[u8]; 2]) -> anyhow::Result<Self::Return>;
}

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

/// Encodes a PDF text string, using UTF-16BE only when ASCII won't do.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        Object::String(text.as_bytes().to_vec(), StringFormat::Literal)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        bytes.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

/// Decodes a PDF text string. Strings without the UTF-16BE byte order mark
/// are taken as Latin-1, which covers PDFDocEncoding for printable text.
fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Formats a time as a PDF date string, e.g. `D:20240131120000+00'00'`.
fn format_pdf_date(time: &DateTime<Utc>) -> String {
    time.format("D:%Y%m%d%H%M%S+00'00'").to_string()
}

/// Parses a PDF date string. Missing trailing fields take their lowest value,
/// a missing offset means UTC.
fn parse_pdf_date(date: &str) -> Option<DateTime<FixedOffset>> {
    let date = date.strip_prefix("D:").unwrap_or(date);
    let digits = date.bytes().take_while(u8::is_ascii_digit).count();
    if digits < 4 {
        return None;
    }
    let field = |start: usize, len: usize, default: u32| -> Option<u32> {
        if start + len <= digits {
            date[start..start + len].parse().ok()
        } else {
            Some(default)
        }
    };
    let year = date[..4].parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, field(4, 2, 1)?, field(6, 2, 1)?)?.and_hms_opt(
        field(8, 2, 0)?,
        field(10, 2, 0)?,
        field(12, 2, 0)?,
    )?;

    let zone = &date[digits..];
    let offset_seconds = match zone.as_bytes().first() {
        Some(sign @ (b'+' | b'-')) => {
            let numbers: Vec<i32> = zone[1..]
                .split('\'')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .collect::<std::result::Result<_, _>>()
                .ok()?;
            let hours = numbers.first().copied().unwrap_or(0);
            let minutes = numbers.get(1).copied().unwrap_or(0);
            let seconds = hours * 3600 + minutes * 60;
            if *sign == b'-' {
                -seconds
            } else {
                seconds
            }
        }
        _ => 0,
    };
    FixedOffset::east_opt(offset_seconds)?
        .from_local_datetime(&naive)
        .single()
}
