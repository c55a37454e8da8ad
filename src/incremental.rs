//! Append-only revisions.
//!
//! [`IncrementalUpdate`] works on an owned copy of the parsed document, keeps
//! track of every object created or touched, and serializes just those objects
//! after the untouched original bytes, followed by a classic cross-reference
//! section and a trailer pointing back to the previous one.

use std::collections::BTreeSet;
use std::io::Write;

use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};

use crate::byte_range::{PlaceholderOffsets, SignaturePlaceholder};
use crate::{pdf_ends_with_eof, Error, Result};

lazy_static::lazy_static! {
    static ref STARTXREF_REGEX: Regex = Regex::new(r"startxref\s+(\d+)\s+%%EOF").unwrap();
}

/// Trailer keys that describe the previous cross-reference section only.
const SECTION_KEYS: &[&[u8]] = &[
    b"Prev", b"XRefStm", b"Size", b"Type", b"W", b"Index", b"Filter", b"DecodeParms", b"Length",
];

/// One revision being built on top of an existing file.
pub struct IncrementalUpdate<'a> {
    original: &'a [u8],
    document: Document,
    previous_xref: usize,
    included: BTreeSet<ObjectId>,
    signature: Option<(ObjectId, SignaturePlaceholder)>,
}

/// A serialized revision, already appended to the original bytes.
#[derive(Debug)]
pub struct Revision {
    pub bytes: Vec<u8>,
    /// Where the signature placeholders ended up, if one was reserved.
    pub placeholder: Option<PlaceholderOffsets>,
}

impl<'a> IncrementalUpdate<'a> {
    /// Parses `original` and prepares an empty revision on top of it.
    pub fn new(original: &'a [u8]) -> Result<Self> {
        let document = Document::load_mem(original).map_err(Error::DocumentLoad)?;
        Self::with_document(original, document)
    }

    /// Same as [`Self::new`], for a caller that already parsed the file.
    pub fn with_document(original: &'a [u8], document: Document) -> Result<Self> {
        if !pdf_ends_with_eof(original) {
            return Err(Error::Structural(
                "document does not end with an %%EOF marker".into(),
            ));
        }
        let previous_xref = last_startxref(original)
            .ok_or_else(|| Error::Structural("no startxref before the final %%EOF".into()))?;

        Ok(Self {
            original,
            document,
            previous_xref,
            included: BTreeSet::new(),
            signature: None,
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn original_len(&self) -> usize {
        self.original.len()
    }

    /// Reference to the document catalog.
    pub fn root_id(&self) -> Result<ObjectId> {
        Ok(self.document.trailer.get(b"Root")?.as_reference()?)
    }

    /// Adds a new indirect object to this revision.
    pub fn add_object(&mut self, object: impl Into<Object>) -> ObjectId {
        self.document.max_id += 1;
        let id = (self.document.max_id, 0);
        self.document.objects.insert(id, object.into());
        self.included.insert(id);
        id
    }

    /// Gives mutable access to an existing object, which will be rewritten in
    /// this revision.
    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        let object = self
            .document
            .objects
            .get_mut(&id)
            .ok_or_else(|| Error::Structural(format!("object {} {} R does not exist", id.0, id.1)))?;
        self.included.insert(id);
        Ok(object)
    }

    pub fn dictionary_mut(&mut self, id: ObjectId) -> Result<&mut Dictionary> {
        Ok(self.object_mut(id)?.as_dict_mut()?)
    }

    /// Forces objects into this revision even if nothing here changed them.
    ///
    /// Annotations attached to a page are easy to lose otherwise, since the
    /// page tree itself may look untouched.
    pub fn include(&mut self, ids: impl IntoIterator<Item = ObjectId>) -> Result<()> {
        for id in ids {
            if !self.document.objects.contains_key(&id) {
                return Err(Error::Structural(format!(
                    "object {} {} R can not be included, it does not exist",
                    id.0, id.1
                )));
            }
            self.included.insert(id);
        }
        Ok(())
    }

    pub fn is_included(&self, id: ObjectId) -> bool {
        self.included.contains(&id)
    }

    /// Sets an entry of the trailer written with this revision.
    pub fn set_trailer(&mut self, key: &str, value: impl Into<Object>) {
        self.document.trailer.set(key, value);
    }

    /// Gives the document an `/ID` if it has none, derived from `seed` so the
    /// same signing event always yields the same identifier.
    pub fn ensure_document_id(&mut self, seed: &[u8]) {
        if self.document.trailer.has(b"ID") {
            return;
        }
        let id = Sha256::digest(seed)[..16].to_vec();
        log::debug!("document has no /ID, deriving {}", hex::encode_upper(&id));
        self.document.trailer.set(
            "ID",
            Object::Array(vec![
                Object::String(id.clone(), StringFormat::Hexadecimal),
                Object::String(id, StringFormat::Hexadecimal),
            ]),
        );
    }

    /// Marks `id` as the signature dictionary whose `/Contents` and
    /// `/ByteRange` are written as fixed width placeholders.
    pub fn reserve_signature(&mut self, id: ObjectId, placeholder: SignaturePlaceholder) -> Result<()> {
        self.include([id])?;
        self.signature = Some((id, placeholder));
        Ok(())
    }

    /// Serializes the revision. The original bytes are copied, never modified,
    /// and nothing is returned unless the whole revision was written.
    pub fn finish(self) -> Result<Revision> {
        let base = self.original.len();
        let mut out = Vec::new();
        if !matches!(self.original.last(), Some(b'\n' | b'\r')) {
            out.push(b'\n');
        }

        let mut placeholder = None;
        let mut offsets = Vec::with_capacity(self.included.len());
        for &id in &self.included {
            let object = self.document.objects.get(&id).ok_or_else(|| {
                Error::Structural(format!("object {} {} R vanished before writing", id.0, id.1))
            })?;
            offsets.push((id, base + out.len()));
            log::trace!("writing object {} {} R at {}", id.0, id.1, base + out.len());

            write!(out, "{} {} obj\n", id.0, id.1)?;
            match &self.signature {
                Some((sig_id, reserved)) if *sig_id == id => {
                    let dict = object.as_dict().map_err(|_| {
                        Error::InvalidState("the signature object is not a dictionary".into())
                    })?;
                    placeholder = Some(write_signature_dictionary(&mut out, base, dict, reserved)?);
                }
                _ => write_object(&mut out, object)?,
            }
            out.extend_from_slice(b"\nendobj\n");
        }

        let xref_offset = base + out.len();
        out.extend_from_slice(b"xref\n");
        for run in consecutive_runs(&offsets) {
            write!(out, "{} {}\n", run[0].0 .0, run.len())?;
            for ((_, generation), offset) in run {
                write!(out, "{offset:010} {generation:05} n\r\n")?;
            }
        }

        let mut trailer = Dictionary::new();
        for (key, value) in self.document.trailer.iter() {
            if !SECTION_KEYS.contains(&key.as_slice()) {
                trailer.set(key.clone(), value.clone());
            }
        }
        let previous_size = self
            .document
            .trailer
            .get(b"Size")
            .and_then(Object::as_i64)
            .unwrap_or(0);
        let size = previous_size.max(self.document.max_id as i64 + 1);
        trailer.set("Size", Object::Integer(size));
        trailer.set("Prev", Object::Integer(self.previous_xref as i64));

        out.extend_from_slice(b"trailer\n");
        write_dictionary(&mut out, &trailer)?;
        write!(out, "\nstartxref\n{xref_offset}\n%%EOF\n")?;

        if self.signature.is_some() && placeholder.is_none() {
            return Err(Error::InvalidState(
                "reserved signature object was not written".into(),
            ));
        }
        log::debug!(
            "revision of {} objects appended at {base}, {} bytes long",
            offsets.len(),
            out.len()
        );

        let mut bytes = Vec::with_capacity(base + out.len());
        bytes.extend_from_slice(self.original);
        bytes.extend_from_slice(&out);
        Ok(Revision { bytes, placeholder })
    }
}

/// Offset of the cross-reference section the file currently ends with.
fn last_startxref(bytes: &[u8]) -> Option<usize> {
    let captures = STARTXREF_REGEX.captures_iter(bytes).last()?;
    std::str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse()
        .ok()
}

/// Splits sorted entries into subsections of consecutive object numbers.
fn consecutive_runs(entries: &[(ObjectId, usize)]) -> Vec<&[(ObjectId, usize)]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=entries.len() {
        if i == entries.len() || entries[i].0 .0 != entries[i - 1].0 .0 + 1 {
            if start < i {
                runs.push(&entries[start..i]);
            }
            start = i;
        }
    }
    runs
}

fn write_signature_dictionary(
    out: &mut Vec<u8>,
    base: usize,
    dict: &Dictionary,
    reserved: &SignaturePlaceholder,
) -> Result<PlaceholderOffsets> {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        if key == b"Contents" || key == b"ByteRange" {
            continue;
        }
        write_name(out, key);
        out.push(b' ');
        write_object(out, value)?;
    }

    out.extend_from_slice(b"/ByteRange ");
    let byte_range_start = base + out.len();
    out.extend_from_slice(&reserved.byte_range_text());
    let byte_range = byte_range_start..base + out.len();

    out.extend_from_slice(b"/Contents ");
    let contents_start = base + out.len();
    out.extend_from_slice(&reserved.contents_text());
    let contents = contents_start..base + out.len();

    out.extend_from_slice(b">>");
    Ok(PlaceholderOffsets {
        contents,
        byte_range,
    })
}

fn write_object(out: &mut Vec<u8>, object: &Object) -> Result<()> {
    match object {
        Object::Null => out.extend_from_slice(b"null"),
        Object::Boolean(value) => out.extend_from_slice(if *value { b"true" } else { b"false" }),
        Object::Integer(value) => write!(out, "{value}")?,
        Object::Real(value) => write_real(out, *value)?,
        Object::Name(name) => write_name(out, name),
        Object::String(text, StringFormat::Literal) => write_literal_string(out, text),
        Object::String(text, StringFormat::Hexadecimal) => {
            out.push(b'<');
            out.extend_from_slice(hex::encode_upper(text).as_bytes());
            out.push(b'>');
        }
        Object::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                write_object(out, item)?;
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dictionary(out, dict)?,
        Object::Stream(stream) => {
            let mut dict = stream.dict.clone();
            dict.set("Length", Object::Integer(stream.content.len() as i64));
            write_dictionary(out, &dict)?;
            out.extend_from_slice(b"\nstream\n");
            out.extend_from_slice(&stream.content);
            out.extend_from_slice(b"\nendstream");
        }
        Object::Reference((number, generation)) => write!(out, "{number} {generation} R")?,
    }
    Ok(())
}

fn write_dictionary(out: &mut Vec<u8>, dict: &Dictionary) -> Result<()> {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        write_name(out, key);
        out.push(b' ');
        write_object(out, value)?;
    }
    out.extend_from_slice(b">>");
    Ok(())
}

fn write_real(out: &mut Vec<u8>, value: f32) -> Result<()> {
    if !value.is_finite() {
        out.push(b'0');
    } else if value.fract() == 0.0 && value.abs() < 1e9 {
        write!(out, "{}", value as i64)?;
    } else {
        let text = format!("{value:.4}");
        out.extend_from_slice(text.trim_end_matches('0').trim_end_matches('.').as_bytes());
    }
    Ok(())
}

fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    out.push(b'/');
    for &b in name {
        let delimiter = b"()<>[]{}/%#".contains(&b);
        if (0x21..=0x7E).contains(&b) && !delimiter {
            out.push(b);
        } else {
            out.extend_from_slice(format!("#{b:02X}").as_bytes());
        }
    }
}

fn write_literal_string(out: &mut Vec<u8>, text: &[u8]) {
    out.push(b'(');
    for &b in text {
        match b {
            b'(' | b')' | b'\\' => out.extend_from_slice(&[b'\\', b]),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
    out.push(b')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_range::{reserve_range, ByteRange};
    use crate::test_support::sample_pdf;
    use lopdf::dictionary;

    #[test]
    fn prefix_is_preserved() {
        let original = sample_pdf(2);
        let prefix_digest = Sha256::digest(&original);

        let mut update = IncrementalUpdate::new(&original).unwrap();
        let note = update.add_object(dictionary! {
            "Type" => "Note",
            "Text" => Object::string_literal("hello (world)"),
        });
        let root = update.root_id().unwrap();
        update
            .dictionary_mut(root)
            .unwrap()
            .set("Note", Object::Reference(note));
        let revision = update.finish().unwrap();

        assert!(revision.bytes.len() > original.len());
        assert_eq!(
            Sha256::digest(&revision.bytes[..original.len()]),
            prefix_digest
        );

        let reloaded = Document::load_mem(&revision.bytes).unwrap();
        let catalog = reloaded.catalog().unwrap();
        let note_dict = reloaded
            .get_dictionary(catalog.get(b"Note").unwrap().as_reference().unwrap())
            .unwrap();
        assert_eq!(
            note_dict.get(b"Text").unwrap().as_str().unwrap(),
            b"hello (world)"
        );
        assert_eq!(reloaded.get_pages().len(), 2);
        assert_eq!(
            reloaded.trailer.get(b"Prev").unwrap().as_i64().unwrap() as usize,
            last_startxref(&original).unwrap()
        );
    }

    #[test]
    fn untouched_objects_are_not_rewritten() {
        let original = sample_pdf(1);
        let mut update = IncrementalUpdate::new(&original).unwrap();
        let page = *update.document().get_pages().get(&1).unwrap();
        let added = update.add_object(Object::Integer(7));
        assert!(update.is_included(added));
        assert!(!update.is_included(page));

        update.include([page]).unwrap();
        assert!(update.is_included(page));
        assert!(matches!(update.include([(9999, 0)]), Err(Error::Structural(_))));

        let revision = update.finish().unwrap();
        let tail = String::from_utf8_lossy(&revision.bytes[original.len()..]).into_owned();
        assert!(tail.contains(&format!("{} 0 obj", page.0)));
        assert!(tail.contains(&format!("{} 0 obj", added.0)));
        assert_eq!(tail.matches(" obj\n").count(), 2);
    }

    #[test]
    fn document_id_is_derived_from_seed() {
        let original = sample_pdf(1);
        let build = |seed: &[u8]| {
            let mut update = IncrementalUpdate::new(&original).unwrap();
            update.ensure_document_id(seed);
            update.add_object(Object::Null);
            update.finish().unwrap().bytes
        };
        assert_eq!(build(b"2024-01-31T12:00:00Z"), build(b"2024-01-31T12:00:00Z"));
        assert_ne!(build(b"2024-01-31T12:00:00Z"), build(b"2024-01-31T12:00:01Z"));

        let reloaded = Document::load_mem(&build(b"seed")).unwrap();
        let ids = reloaded.trailer.get(b"ID").unwrap().as_array().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].as_str().unwrap(), &Sha256::digest(b"seed")[..16]);
    }

    #[test]
    fn signature_placeholders_are_located() {
        let original = sample_pdf(1);
        let mut update = IncrementalUpdate::new(&original).unwrap();
        let sig = update.add_object(dictionary! {
            "Type" => "Sig",
            "Contents" => Object::String(Vec::new(), StringFormat::Hexadecimal),
        });
        update.reserve_signature(sig, reserve_range(16).unwrap()).unwrap();
        let revision = update.finish().unwrap();

        let offsets = revision.placeholder.unwrap();
        let contents = &revision.bytes[offsets.contents.clone()];
        assert_eq!(contents.len(), 34);
        assert_eq!(contents[0], b'<');
        assert_eq!(contents[33], b'>');
        assert_eq!(revision.bytes[offsets.byte_range.start], b'[');
        assert_eq!(revision.bytes[offsets.byte_range.end - 1], b']');

        let range =
            ByteRange::around_placeholder(revision.bytes.len(), &offsets.contents).unwrap();
        assert!(range.covers_whole_document(revision.bytes.len()));
    }

    #[test]
    fn original_without_final_newline() {
        let mut original = sample_pdf(1);
        while matches!(original.last(), Some(b'\n' | b'\r')) {
            original.pop();
        }
        let mut update = IncrementalUpdate::new(&original).unwrap();
        update.add_object(Object::Integer(1));
        let revision = update.finish().unwrap();
        assert!(revision.bytes.starts_with(&original));
        assert!(Document::load_mem(&revision.bytes).is_ok());
    }

    #[test]
    fn rejects_truncated_files() {
        let original = sample_pdf(1);
        let truncated = &original[..original.len() - 10];
        assert!(IncrementalUpdate::new(truncated).is_err());
    }

    #[test]
    fn serializes_names_and_numbers() {
        let mut out = Vec::new();
        write_name(&mut out, b"A B#");
        assert_eq!(out, b"/A#20B#23");

        let mut out = Vec::new();
        write_object(
            &mut out,
            &Object::Array(vec![
                Object::Real(1.5),
                Object::Real(2.0),
                Object::Real(f32::NAN),
                Object::Boolean(true),
                Object::Reference((3, 0)),
            ]),
        )
        .unwrap();
        assert_eq!(out, b"[1.5 2 0 true 3 0 R]");
    }
}
