//! Byte range arithmetic around the signature placeholder.
//!
//! A signature digests the whole revision except for the hex string holding
//! the signature value itself. The `/ByteRange` array records the two digested
//! segments, and everything here is about computing, checking and filling it.

use std::io::Read;
use std::ops::Range;

use crate::{Error, Result};

/// Width of each number reserved in the `/ByteRange` placeholder. Ten digits
/// are enough for files up to 9.3 GiB.
const BYTE_RANGE_DIGITS: usize = 10;

/// The `/ByteRange` of a signature: `[s0, l0, s1, l1]`.
///
/// `[s0, s0 + l0)` and `[s1, s1 + l1)` are the digested segments. The gap
/// between them holds the hex encoded signature value, delimiters included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange(pub [i64; 4]);

impl ByteRange {
    pub fn new(s0: i64, l0: i64, s1: i64, l1: i64) -> Self {
        Self([s0, l0, s1, l1])
    }

    /// Computes the byte range of a file of `file_length` bytes whose only
    /// undigested part is the `/Contents` placeholder.
    pub fn around_placeholder(file_length: usize, placeholder: &Range<usize>) -> Result<Self> {
        if placeholder.start > placeholder.end || placeholder.end > file_length {
            return Err(Error::InvalidState(format!(
                "placeholder {placeholder:?} does not fit in a file of {file_length} bytes"
            )));
        }
        Ok(Self([
            0,
            placeholder.start as i64,
            placeholder.end as i64,
            (file_length - placeholder.end) as i64,
        ]))
    }

    /// Checks that the segments are non-negative, in order, and inside the file.
    pub fn validate(&self, file_length: usize) -> Result<()> {
        let [s0, l0, s1, l1] = self.0;
        if self.0.iter().any(|&v| v < 0) {
            return Err(Error::MalformedSignature(
                "byte range holds negative values".into(),
            ));
        }
        let (Some(first_end), Some(second_end)) = (s0.checked_add(l0), s1.checked_add(l1)) else {
            return Err(Error::MalformedSignature("byte range overflows".into()));
        };
        if first_end > s1 {
            return Err(Error::MalformedSignature(
                "byte range segments overlap or are out of order".into(),
            ));
        }
        if second_end > file_length as i64 {
            return Err(Error::MalformedSignature(format!(
                "byte range ends at {second_end}, past the end of the file at {file_length}"
            )));
        }
        Ok(())
    }

    /// True if nothing was appended to the file after the revision this byte
    /// range belongs to.
    pub fn covers_whole_document(&self, file_length: usize) -> bool {
        let [s0, l0, s1, l1] = self.0;
        l0 + (s1 - s0 - l0) + l1 == file_length as i64
    }

    /// Offset right after the last digested byte.
    pub fn end(&self) -> i64 {
        self.0[2] + self.0[3]
    }

    /// The two digested segments. Only meaningful after [`Self::validate`].
    pub fn segments(&self) -> [Range<usize>; 2] {
        let [s0, l0, s1, l1] = self.0.map(|v| v.max(0) as usize);
        [s0..s0 + l0, s1..s1 + l1]
    }

    /// The undigested gap, holding the hex string with the signature value.
    pub fn gap(&self) -> Range<usize> {
        let [first, second] = self.segments();
        first.end..second.start
    }

    /// Borrows the two digested segments out of the file.
    pub fn signed_data<'a>(&self, file_bytes: &'a [u8]) -> Result<[&'a [u8]; 2]> {
        self.validate(file_bytes.len())?;
        let [first, second] = self.segments();
        Ok([&file_bytes[first], &file_bytes[second]])
    }

    /// Concatenation of the two digested segments.
    pub fn extract_digested_bytes(&self, file_bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signed_data(file_bytes)?.concat())
    }

    /// Streams the digested segments, in order, without copying them.
    pub fn reader<'a>(&self, file_bytes: &'a [u8]) -> Result<impl Read + 'a> {
        let [first, second] = self.signed_data(file_bytes)?;
        Ok(first.chain(second))
    }

    /// Decodes the signature value found in the gap, if the gap is exactly one
    /// hex string.
    pub fn extract_signature_value(&self, file_bytes: &[u8]) -> Option<Vec<u8>> {
        let gap = self.gap();
        decode_pdf_hex_string(file_bytes.get(gap)?)
    }

    fn to_pdf_array(self) -> String {
        let [s0, l0, s1, l1] = self.0;
        format!("[{s0} {l0} {s1} {l1}]")
    }
}

/// Space reserved in a revision for a signature value that is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignaturePlaceholder {
    signature_size: usize,
}

/// Offsets of the reserved placeholders in a serialized revision, counted from
/// the start of the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderOffsets {
    /// The `/Contents` hex string, `<` and `>` included.
    pub contents: Range<usize>,
    /// The `/ByteRange` array, brackets included.
    pub byte_range: Range<usize>,
}

/// Reserves room for a signature of at most `estimated_signature_size` bytes.
pub fn reserve_range(estimated_signature_size: usize) -> Result<SignaturePlaceholder> {
    if estimated_signature_size == 0 {
        return Err(Error::InvalidState(
            "the reserved signature size must not be zero".into(),
        ));
    }
    Ok(SignaturePlaceholder {
        signature_size: estimated_signature_size,
    })
}

impl SignaturePlaceholder {
    pub fn signature_size(&self) -> usize {
        self.signature_size
    }

    /// Hex string of zeros, two digits per reserved byte plus the delimiters.
    pub(crate) fn contents_text(&self) -> Vec<u8> {
        let mut text = Vec::with_capacity(self.signature_size * 2 + 2);
        text.push(b'<');
        text.resize(self.signature_size * 2 + 1, b'0');
        text.push(b'>');
        text
    }

    /// Fixed width array, large enough for any byte range it will receive.
    pub(crate) fn byte_range_text(&self) -> Vec<u8> {
        let zeros = "0".repeat(BYTE_RANGE_DIGITS);
        format!("[0 {zeros} {zeros} {zeros}]").into_bytes()
    }
}

/// Writes the final `/ByteRange` over its placeholder, padding with spaces.
pub fn write_byte_range(bytes: &mut [u8], slot: &Range<usize>, range: &ByteRange) -> Result<()> {
    let text = range.to_pdf_array();
    let slot_bytes = bytes
        .get_mut(slot.clone())
        .ok_or_else(|| Error::InvalidState("byte range slot is outside the file".into()))?;
    if text.len() > slot_bytes.len() {
        return Err(Error::InvalidState(format!(
            "byte range {text} does not fit in its {} bytes placeholder",
            slot_bytes.len()
        )));
    }
    let (numbers, closing) = text.as_bytes().split_at(text.len() - 1);
    slot_bytes.fill(b' ');
    slot_bytes[..numbers.len()].copy_from_slice(numbers);
    let last = slot_bytes.len() - 1;
    slot_bytes[last..].copy_from_slice(closing);
    Ok(())
}

/// Writes the signature value into the `/Contents` placeholder. The unused
/// tail keeps its zero padding.
pub fn insert_signature(bytes: &mut [u8], contents: &Range<usize>, signature: &[u8]) -> Result<()> {
    let placeholder = bytes
        .get_mut(contents.clone())
        .ok_or_else(|| Error::InvalidState("contents placeholder is outside the file".into()))?;
    let available = placeholder.len().saturating_sub(2);
    let encoded = hex::encode_upper(signature);
    if encoded.len() > available {
        return Err(Error::InvalidState(format!(
            "signature of {} bytes exceeds the {} bytes reserved for it",
            signature.len(),
            available / 2
        )));
    }
    placeholder[1..1 + encoded.len()].copy_from_slice(encoded.as_bytes());
    Ok(())
}

/// Decodes a PDF hex string, including the delimiters '<' and '>'.
///
/// Whitespace between the digits is skipped. Returns None if anything else
/// than hex digits and whitespace lies between the delimiters.
pub(crate) fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    // First and last characters must be the delimiters '<' and '>'.
    if hex_input.len() < 2 || hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>')
    {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::with_capacity(hex_input.len() / 2);
    let mut hex_iter = hex_input
        .iter()
        .filter(|b| !is_pdf_whitespace(**b))
        .map(|&b| (b as char).to_digit(16));

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

fn is_pdf_whitespace(b: u8) -> bool {
    matches!(b, b'\0' | b'\t' | b'\n' | b'\x0C' | b'\r' | b' ')
}
