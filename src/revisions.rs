//! Recovery of every signature and document timestamp in a file.
//!
//! Each signature dictionary is checked on its own. A broken or tampered
//! revision is excluded with its reason, and the others are still returned,
//! ordered by where their revision ends in the file.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset};
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use sha1::{Digest, Sha1};

use crate::byte_range::ByteRange;
use crate::{
    decode_text_string, parse_pdf_date, pdf_ends_with_eof, Error, ExactArrayOrNone, Result,
    SignatureVerifier,
};

/// Sub-filter of document timestamps.
pub const TIMESTAMP_SUB_FILTER: &[u8] = b"ETSI.RFC3161";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    Signature,
    /// A document timestamp. It is an archive timestamp when the revisions it
    /// covers already carried a DSS dictionary.
    DocumentTimestamp { archive: bool },
}

/// One signature or document timestamp, as found in the file.
///
/// Nothing here has been cryptographically verified. See
/// [`SignatureRevision::verify_with`].
#[derive(Debug, Clone)]
pub struct SignatureRevision {
    /// The signature dictionary.
    pub object_id: ObjectId,
    pub byte_range: ByteRange,
    /// Decoded `/Contents`, zero padding included.
    pub contents: Vec<u8>,
    /// Every field whose value is this signature dictionary.
    pub field_names: Vec<String>,
    pub kind: RevisionKind,
    pub sub_filter: Option<String>,
    pub covers_whole_document: bool,
    /// Index of the next revision in the chain, the one that encloses this.
    pub outer_revision: Option<usize>,
    pub signer_name: Option<String>,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
    /// The `/M` entry. Claimed by the signer, not attested.
    pub signing_time: Option<DateTime<FixedOffset>>,
}

impl SignatureRevision {
    /// The signature value without the zero padding of its placeholder.
    pub fn signature_value(&self) -> &[u8] {
        trim_der_padding(&self.contents)
    }

    /// Key of this signature in the DSS `/VRI` dictionary.
    pub fn vri_key(&self) -> String {
        vri_key(&self.contents)
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self.kind, RevisionKind::DocumentTimestamp { .. })
    }

    /// The two digested segments of `pdf_bytes`.
    pub fn signed_data<'b>(&self, pdf_bytes: &'b [u8]) -> Result<[&'b [u8]; 2]> {
        self.byte_range.signed_data(pdf_bytes)
    }

    pub fn digested_bytes(&self, pdf_bytes: &[u8]) -> Result<Vec<u8>> {
        self.byte_range.extract_digested_bytes(pdf_bytes)
    }

    /// Hands the signature value and the bytes it signs to `verifier`.
    pub fn verify_with<V: SignatureVerifier>(
        &self,
        pdf_bytes: &[u8],
        verifier: V,
    ) -> anyhow::Result<V::Return> {
        let signed_data = self.signed_data(pdf_bytes)?;
        verifier.verify(self.signature_value(), signed_data)
    }
}

/// A signature that was left out of the chain, and why.
#[derive(Debug)]
pub struct ExcludedRevision {
    pub object_id: Option<ObjectId>,
    pub field_names: Vec<String>,
    pub reason: Error,
}

/// Everything [`parse_revisions`] could make of a document.
#[derive(Debug, Default)]
pub struct RevisionReport {
    /// Valid revisions, the earliest first.
    pub revisions: Vec<SignatureRevision>,
    pub excluded: Vec<ExcludedRevision>,
    /// Whether the latest revision has a DSS dictionary.
    pub has_dss: bool,
}

impl RevisionReport {
    /// Revisions enclosing the one at `index`, innermost first.
    pub fn enclosing(&self, index: usize) -> impl Iterator<Item = &SignatureRevision> + '_ {
        let mut next = self.revisions.get(index).and_then(|r| r.outer_revision);
        std::iter::from_fn(move || {
            let revision = self.revisions.get(next?)?;
            next = revision.outer_revision;
            Some(revision)
        })
    }

    /// The revision that ends last in the file.
    pub fn latest(&self) -> Option<&SignatureRevision> {
        self.revisions.last()
    }
}

/// Parses a document and recovers all its signature revisions.
///
/// Fails only if the file itself can not be loaded. Problems with single
/// signatures end up in [`RevisionReport::excluded`].
pub fn parse_revisions(pdf_bytes: &[u8]) -> Result<RevisionReport> {
    let doc = Document::load_mem(pdf_bytes).map_err(Error::DocumentLoad)?;
    parse_document(pdf_bytes, &doc)
}

pub(crate) fn parse_document(pdf_bytes: &[u8], doc: &Document) -> Result<RevisionReport> {
    let has_dss = doc.catalog()?.has(b"DSS");

    // Group the fields by the identity of their value dictionary.
    let mut grouped: Vec<(ObjectId, Vec<String>)> = Vec::new();
    let mut excluded = Vec::new();
    for field in signature_fields(doc)? {
        match field.value {
            None => continue,
            Some(Object::Reference(value_id)) => {
                match grouped.iter_mut().find(|(id, _)| *id == value_id) {
                    Some((_, names)) => {
                        log::warn!(
                            "fields {names:?} and \"{}\" share the signature dictionary {} {} R",
                            field.name,
                            value_id.0,
                            value_id.1
                        );
                        names.push(field.name);
                    }
                    None => grouped.push((value_id, vec![field.name])),
                }
            }
            Some(_) => excluded.push(ExcludedRevision {
                object_id: None,
                field_names: vec![field.name],
                reason: Error::MalformedSignature(
                    "signature value is not an indirect dictionary".into(),
                ),
            }),
        }
    }

    let mut revisions = Vec::new();
    for (object_id, field_names) in grouped {
        match process_signature(pdf_bytes, doc, object_id) {
            Ok(parsed) => revisions.push(parsed.into_revision(object_id, field_names, pdf_bytes)),
            Err(reason) => {
                log::warn!("excluding signature of fields {field_names:?}: {reason}");
                excluded.push(ExcludedRevision {
                    object_id: Some(object_id),
                    field_names,
                    reason,
                });
            }
        }
    }

    revisions.sort_by_key(|r: &SignatureRevision| r.byte_range.end());
    let count = revisions.len();
    for (i, revision) in revisions.iter_mut().enumerate() {
        revision.outer_revision = (i + 1 < count).then_some(i + 1);
    }

    Ok(RevisionReport {
        revisions,
        excluded,
        has_dss,
    })
}

struct ParsedSignature {
    byte_range: ByteRange,
    contents: Vec<u8>,
    sub_filter: Option<String>,
    is_timestamp: bool,
    signer_name: Option<String>,
    reason: Option<String>,
    location: Option<String>,
    contact_info: Option<String>,
    signing_time: Option<DateTime<FixedOffset>>,
}

impl ParsedSignature {
    fn into_revision(
        self,
        object_id: ObjectId,
        field_names: Vec<String>,
        pdf_bytes: &[u8],
    ) -> SignatureRevision {
        let kind = if self.is_timestamp {
            RevisionKind::DocumentTimestamp {
                archive: trust_material_before(pdf_bytes, &self.byte_range),
            }
        } else {
            RevisionKind::Signature
        };
        SignatureRevision {
            object_id,
            covers_whole_document: self.byte_range.covers_whole_document(pdf_bytes.len()),
            byte_range: self.byte_range,
            contents: self.contents,
            field_names,
            kind,
            sub_filter: self.sub_filter,
            outer_revision: None,
            signer_name: self.signer_name,
            reason: self.reason,
            location: self.location,
            contact_info: self.contact_info,
            signing_time: self.signing_time,
        }
    }
}

fn malformed(reason: &str) -> Error {
    Error::MalformedSignature(reason.to_string())
}

fn process_signature(pdf_bytes: &[u8], doc: &Document, obj_id: ObjectId) -> Result<ParsedSignature> {
    let signature = doc
        .get_object(obj_id)
        .and_then(Object::as_dict)
        .map_err(|_| malformed("signature value is not a dictionary"))?;

    let values = signature
        .get(b"ByteRange")
        .and_then(|r| doc.dereference(r))
        .and_then(|(_, r)| r.as_array())
        .map_err(|_| malformed("signature has no /ByteRange array"))?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()
        .map_err(|_| malformed("/ByteRange holds something other than integers"))?
        .0
        .ok_or_else(|| malformed("/ByteRange must hold exactly four integers"))?;
    let byte_range = ByteRange(values);
    byte_range.validate(pdf_bytes.len())?;

    // For soundness, the signature must cover the file since the beginning.
    if values[0] != 0 {
        return Err(malformed("signature does not cover the file from its beginning"));
    }

    // The signature dictionary must be inside the first signed segment.
    if let Some(XrefEntry::Normal { offset, .. }) = doc.reference_table.get(obj_id.0) {
        if *offset as i64 >= values[1] {
            return Err(malformed("signature dictionary lies outside the signed bytes"));
        }
    }

    // The /Contents must be exactly what the byte range skips over.
    let declared = signature
        .get(b"Contents")
        .and_then(|c| doc.dereference(c))
        .and_then(|(_, c)| c.as_str())
        .map_err(|_| malformed("signature has no /Contents string"))?;
    match byte_range.extract_signature_value(pdf_bytes) {
        Some(extracted) if extracted == declared => {}
        _ => return Err(Error::TamperDetected),
    }

    // The signed range must end where a revision ends.
    if !pdf_ends_with_eof(&pdf_bytes[..byte_range.end() as usize]) {
        return Err(malformed("byte range does not end at the end of a revision"));
    }

    let sub_filter = signature
        .get(b"SubFilter")
        .and_then(Object::as_name)
        .ok()
        .map(|name| String::from_utf8_lossy(name).into_owned());
    let is_timestamp = sub_filter.as_deref().map(str::as_bytes) == Some(TIMESTAMP_SUB_FILTER);

    Ok(ParsedSignature {
        byte_range,
        contents: declared.to_vec(),
        sub_filter,
        is_timestamp,
        signer_name: text_entry(doc, signature, b"Name"),
        reason: text_entry(doc, signature, b"Reason"),
        location: text_entry(doc, signature, b"Location"),
        contact_info: text_entry(doc, signature, b"ContactInfo"),
        signing_time: text_entry(doc, signature, b"M").and_then(|m| parse_pdf_date(&m)),
    })
}

fn text_entry(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    dict.get(key)
        .and_then(|v| doc.dereference(v))
        .and_then(|(_, v)| v.as_str())
        .ok()
        .map(decode_text_string)
}

/// Reloads the file as it was before the revision holding `byte_range` and
/// checks whether it already had a DSS dictionary.
fn trust_material_before(pdf_bytes: &[u8], byte_range: &ByteRange) -> bool {
    let gap_start = byte_range.gap().start.min(pdf_bytes.len());
    let Some(marker) = pdf_bytes[..gap_start]
        .windows(5)
        .rposition(|w| w == b"%%EOF")
    else {
        return false;
    };

    let mut end = marker + 5;
    for _ in 0..2 {
        if end < gap_start && matches!(pdf_bytes[end], b'\r' | b'\n') {
            end += 1;
        }
    }

    match Document::load_mem(&pdf_bytes[..end]) {
        Ok(previous) => previous.catalog().map(|c| c.has(b"DSS")).unwrap_or(false),
        Err(e) => {
            log::warn!("revision before the timestamp at {end} could not be loaded: {e}");
            false
        }
    }
}

/// A terminal signature field of the interactive form.
pub(crate) struct SignatureField {
    pub id: Option<ObjectId>,
    /// Fully qualified name.
    pub name: String,
    pub value: Option<Object>,
}

/// Walks the AcroForm field tree and returns every signature field.
pub(crate) fn signature_fields(doc: &Document) -> Result<Vec<SignatureField>> {
    let catalog = doc.catalog()?;
    let fields = catalog
        .get(b"AcroForm")
        .and_then(|a| doc.dereference(a))
        .and_then(|(_, a)| a.as_dict())
        .and_then(|a| a.get(b"Fields"))
        .and_then(|f| doc.dereference(f))
        .and_then(|(_, f)| f.as_array());
    let Ok(fields) = fields else {
        return Ok(Vec::new());
    };

    let mut found = Vec::new();
    let mut visited = HashSet::new();
    for field in fields {
        collect_fields(doc, field, "", None, &mut visited, &mut found);
    }
    Ok(found)
}

fn collect_fields<'d>(
    doc: &'d Document,
    field: &'d Object,
    parent_name: &str,
    inherited_type: Option<&'d [u8]>,
    visited: &mut HashSet<ObjectId>,
    found: &mut Vec<SignatureField>,
) {
    let Ok((id, Object::Dictionary(dict))) = doc.dereference(field) else {
        log::debug!("skipping form field that is not a dictionary");
        return;
    };
    if let Some(id) = id {
        if !visited.insert(id) {
            return;
        }
    }

    let name = match dict.get(b"T").and_then(Object::as_str).map(decode_text_string) {
        Ok(partial) if parent_name.is_empty() => partial,
        Ok(partial) => format!("{parent_name}.{partial}"),
        Err(_) => parent_name.to_string(),
    };
    let field_type = dict.get(b"FT").and_then(Object::as_name).ok().or(inherited_type);

    // Kids without a /T are widgets of this field, not fields of their own.
    let kids = dict
        .get(b"Kids")
        .and_then(|k| doc.dereference(k))
        .and_then(|(_, k)| k.as_array());
    if let Ok(kids) = kids {
        let child_fields: Vec<&Object> = kids
            .iter()
            .filter(|kid| {
                doc.dereference(kid)
                    .and_then(|(_, k)| k.as_dict())
                    .map(|k| k.has(b"T"))
                    .unwrap_or(false)
            })
            .collect();
        if !child_fields.is_empty() {
            for kid in child_fields {
                collect_fields(doc, kid, &name, field_type, visited, found);
            }
            return;
        }
    }

    if field_type == Some(b"Sig".as_slice()) {
        found.push(SignatureField {
            id,
            name,
            value: dict.get(b"V").ok().cloned(),
        });
    }
}

/// Uppercase hex SHA-1 of a signature value, the key of its `/VRI` entry.
pub fn vri_key(signature: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(trim_der_padding(signature)))
}

/// Cuts a DER encoded value at the length its header declares, dropping the
/// placeholder padding that follows. Anything unparsable is returned as is.
pub(crate) fn trim_der_padding(value: &[u8]) -> &[u8] {
    let (Some(0x30), Some(&first)) = (value.first(), value.get(1)) else {
        return value;
    };
    let (header, len) = if first & 0x80 == 0 {
        (2, first as usize)
    } else {
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 || value.len() < 2 + count {
            return value;
        }
        let len = value[2..2 + count]
            .iter()
            .fold(0usize, |acc, &b| acc << 8 | b as usize);
        (2 + count, len)
    };
    match header.checked_add(len) {
        Some(total) if total <= value.len() => &value[..total],
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_range::write_byte_range;
    use crate::dss::{extend_with_trust_material, SignatureValidationData, TokenKind, TrustMaterialToken};
    use crate::incremental::IncrementalUpdate;
    use crate::signing::{PdfSignatureService, SignatureType, SigningParameters};
    use crate::test_support::{fake_signer, sample_pdf};
    use chrono::{TimeZone, Utc};
    use lopdf::{dictionary, StringFormat};

    fn sign(pdf: &[u8], signature_type: SignatureType, second: u32) -> Vec<u8> {
        let params = SigningParameters {
            signature_type,
            signing_time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, second).unwrap(),
            reason: Some("Approval".into()),
            ..Default::default()
        };
        PdfSignatureService::default()
            .sign_with(pdf, &params, &mut fake_signer)
            .unwrap()
    }

    #[test]
    fn unsigned_document_has_no_revisions() {
        let report = parse_revisions(&sample_pdf(1)).unwrap();
        assert!(report.revisions.is_empty());
        assert!(report.excluded.is_empty());
        assert!(!report.has_dss);
    }

    #[test]
    fn unreadable_document_is_fatal() {
        assert!(matches!(
            parse_revisions(b"not a pdf at all"),
            Err(Error::DocumentLoad(_))
        ));
    }

    #[test]
    fn signature_followed_by_timestamp() {
        let signed = sign(&sample_pdf(1), SignatureType::Signature, 0);
        let stamped = sign(&signed, SignatureType::DocumentTimestamp, 1);

        let report = parse_revisions(&stamped).unwrap();
        assert!(report.excluded.is_empty());
        assert_eq!(report.revisions.len(), 2);

        let [signature, timestamp] = &report.revisions[..] else {
            unreachable!()
        };
        assert_eq!(signature.kind, RevisionKind::Signature);
        assert_eq!(signature.field_names, ["Signature1"]);
        assert!(!signature.covers_whole_document);
        assert_eq!(signature.byte_range.end() as usize, signed.len());
        assert_eq!(signature.outer_revision, Some(1));
        assert_eq!(signature.reason.as_deref(), Some("Approval"));
        assert_eq!(
            signature.signing_time.unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(signature.signature_value().len(), 6);
        assert_eq!(
            signature.sub_filter.as_deref(),
            Some("ETSI.CAdES.detached")
        );

        assert_eq!(
            timestamp.kind,
            RevisionKind::DocumentTimestamp { archive: false }
        );
        assert_eq!(timestamp.field_names, ["Signature2"]);
        assert!(timestamp.covers_whole_document);
        assert_eq!(timestamp.outer_revision, None);
        assert!(timestamp.reason.is_none());

        let chain: Vec<_> = report.enclosing(0).map(|r| r.object_id).collect();
        assert_eq!(chain, [timestamp.object_id]);
        assert_eq!(report.latest().unwrap().object_id, timestamp.object_id);
    }

    #[test]
    fn timestamp_over_trust_material_is_archive() {
        let signed = sign(&sample_pdf(1), SignatureType::Signature, 0);
        let signature = parse_revisions(&signed).unwrap().revisions.remove(0);

        let material = SignatureValidationData::new(
            signature.signature_value().to_vec(),
            vec![TrustMaterialToken::new(
                TokenKind::Certificate,
                b"certificate".to_vec(),
            )],
        );
        let extended = extend_with_trust_material(&signed, &[material]).unwrap();
        let stamped = sign(&extended.bytes, SignatureType::DocumentTimestamp, 1);

        let report = parse_revisions(&stamped).unwrap();
        assert!(report.has_dss);
        assert_eq!(
            report.latest().unwrap().kind,
            RevisionKind::DocumentTimestamp { archive: true }
        );
    }

    #[test]
    fn shifted_byte_range_is_excluded() {
        let mut signed = sign(&sample_pdf(1), SignatureType::Signature, 0);
        let signature = parse_revisions(&signed).unwrap().revisions.remove(0);

        let marker = b"/ByteRange ";
        let start = signed
            .windows(marker.len())
            .rposition(|w| w == marker)
            .unwrap()
            + marker.len();
        let end = start + signed[start..].iter().position(|&b| b == b']').unwrap() + 1;
        let [s0, l0, s1, l1] = signature.byte_range.0;
        write_byte_range(&mut signed, &(start..end), &ByteRange::new(s0, l0 + 2, s1, l1)).unwrap();

        let report = parse_revisions(&signed).unwrap();
        assert!(report.revisions.is_empty());
        assert_eq!(report.excluded.len(), 1);
        assert!(matches!(report.excluded[0].reason, Error::TamperDetected));
        assert_eq!(report.excluded[0].field_names, ["Signature1"]);
    }

    #[test]
    fn line_wrapped_contents_are_accepted() {
        let mut signed = sign(&sample_pdf(1), SignatureType::Signature, 0);
        let signature = parse_revisions(&signed).unwrap().revisions.remove(0);
        let gap = signature.byte_range.gap();

        // Break the line before the last hex pair, keeping every offset.
        signed[gap.end - 5..gap.end - 3].copy_from_slice(b"\r\n");

        let report = parse_revisions(&signed).unwrap();
        assert!(report.excluded.is_empty());
        let wrapped = &report.revisions[0];
        assert_eq!(wrapped.contents.len(), signature.contents.len() - 1);
        assert_eq!(wrapped.signature_value(), signature.signature_value());
        assert_eq!(wrapped.byte_range, signature.byte_range);
    }

    #[test]
    fn shared_signature_dictionary_is_merged() {
        let signed = sign(&sample_pdf(1), SignatureType::Signature, 0);
        let value_id = parse_revisions(&signed).unwrap().revisions[0].object_id;

        let mut update = IncrementalUpdate::new(&signed).unwrap();
        let alias = update.add_object(dictionary! {
            "FT" => "Sig",
            "T" => Object::string_literal("Alias"),
            "V" => value_id,
        });
        let root = update.root_id().unwrap();
        let acro_form = update
            .document()
            .get_dictionary(root)
            .unwrap()
            .get(b"AcroForm")
            .unwrap()
            .as_reference()
            .unwrap();
        update
            .dictionary_mut(acro_form)
            .unwrap()
            .get_mut(b"Fields")
            .unwrap()
            .as_array_mut()
            .unwrap()
            .push(Object::Reference(alias));
        let bytes = update.finish().unwrap().bytes;

        let report = parse_revisions(&bytes).unwrap();
        assert_eq!(report.revisions.len(), 1);
        assert_eq!(report.revisions[0].field_names, ["Signature1", "Alias"]);
        assert!(!report.revisions[0].covers_whole_document);
    }

    #[test]
    fn malformed_byte_range_is_excluded() {
        let original = sample_pdf(1);
        let mut update = IncrementalUpdate::new(&original).unwrap();
        let value = update.add_object(dictionary! {
            "Type" => "Sig",
            "ByteRange" => Object::Array(vec![Object::Integer(0), Object::Integer(1), Object::Integer(2)]),
            "Contents" => Object::String(vec![0; 4], StringFormat::Hexadecimal),
        });
        let field = update.add_object(dictionary! {
            "FT" => "Sig",
            "T" => Object::string_literal("Broken"),
            "V" => value,
        });
        let acro_form = update.add_object(dictionary! {
            "Fields" => Object::Array(vec![Object::Reference(field)]),
        });
        let root = update.root_id().unwrap();
        update
            .dictionary_mut(root)
            .unwrap()
            .set("AcroForm", Object::Reference(acro_form));
        let bytes = update.finish().unwrap().bytes;

        let report = parse_revisions(&bytes).unwrap();
        assert!(report.revisions.is_empty());
        assert_eq!(report.excluded.len(), 1);
        assert!(matches!(
            report.excluded[0].reason,
            Error::MalformedSignature(_)
        ));
        assert!(!report.excluded[0].reason.is_fatal());
    }

    #[test]
    fn der_padding_is_trimmed() {
        assert_eq!(trim_der_padding(&[0x30, 0x02, 1, 2, 0, 0]), &[0x30, 0x02, 1, 2]);
        let long = [&[0x30, 0x82, 0x01, 0x00][..], &[7; 256], &[0; 10]].concat();
        assert_eq!(trim_der_padding(&long).len(), 260);
        assert_eq!(trim_der_padding(&[0x30, 0x09, 1]), &[0x30, 0x09, 1]);
        assert_eq!(trim_der_padding(&[1, 2, 3]), &[1, 2, 3]);

        let key = vri_key(&[0x30, 0x02, 1, 2, 0, 0]);
        assert_eq!(key.len(), 40);
        assert_eq!(key, key.to_uppercase());
        assert_eq!(key, vri_key(&[0x30, 0x02, 1, 2]));
    }
}
