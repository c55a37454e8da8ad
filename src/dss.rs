//! Long-term validation material, kept in the catalog's `/DSS` dictionary.
//!
//! Certificates, CRLs and OCSP responses are embedded once each, as plain
//! streams, and found again by the SHA-256 of their bytes. The global
//! `/Certs`, `/CRLs` and `/OCSPs` arrays list everything. The `/VRI`
//! dictionary maps each signature to the part of it that signature needs.

use std::collections::{BTreeMap, HashMap};

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::incremental::IncrementalUpdate;
use crate::revisions::vri_key;
use crate::{Error, Result};

pub type ContentDigest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Certificate,
    Crl,
    Ocsp,
}

impl TokenKind {
    const ALL: [TokenKind; 3] = [TokenKind::Certificate, TokenKind::Crl, TokenKind::Ocsp];

    /// Key of the global array in the DSS dictionary.
    fn dss_key(self) -> &'static str {
        match self {
            TokenKind::Certificate => "Certs",
            TokenKind::Crl => "CRLs",
            TokenKind::Ocsp => "OCSPs",
        }
    }

    /// Key of the array in a VRI entry.
    fn vri_key(self) -> &'static str {
        match self {
            TokenKind::Certificate => "Cert",
            TokenKind::Crl => "CRL",
            TokenKind::Ocsp => "OCSP",
        }
    }
}

/// An encoded certificate, CRL or OCSP response. Its identity is the digest
/// of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustMaterialToken {
    kind: TokenKind,
    encoded: Vec<u8>,
    digest: ContentDigest,
}

impl TrustMaterialToken {
    pub fn new(kind: TokenKind, encoded: Vec<u8>) -> Self {
        let digest = Sha256::digest(&encoded).into();
        Self {
            kind,
            encoded,
            digest,
        }
    }

    /// Builds a token from a digest computed elsewhere. [`Self::verify`] tells
    /// whether the two still agree.
    pub fn from_parts(kind: TokenKind, encoded: Vec<u8>, digest: ContentDigest) -> Self {
        Self {
            kind,
            encoded,
            digest,
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn verify(&self) -> Result<()> {
        if self.encoded.is_empty() {
            return Err(Error::InvalidToken(format!("{:?} token is empty", self.kind)));
        }
        if Sha256::digest(&self.encoded).as_slice() != self.digest {
            return Err(Error::InvalidToken(format!(
                "{:?} token bytes do not match digest {}",
                self.kind,
                hex::encode_upper(self.digest)
            )));
        }
        Ok(())
    }
}

/// The material one signature needs to be validated later.
#[derive(Debug, Clone)]
pub struct SignatureValidationData {
    /// Raw signature value, as found in its `/Contents`.
    pub signature: Vec<u8>,
    pub tokens: Vec<TrustMaterialToken>,
}

impl SignatureValidationData {
    pub fn new(signature: Vec<u8>, tokens: Vec<TrustMaterialToken>) -> Self {
        Self { signature, tokens }
    }

    pub fn vri_key(&self) -> String {
        vri_key(&self.signature)
    }
}

/// Trust material already embedded in a document, by content digest.
#[derive(Debug, Default)]
pub struct KnownObjectMap {
    objects: HashMap<ContentDigest, ObjectId>,
}

impl KnownObjectMap {
    /// Indexes every stream reachable from the DSS global arrays and VRI entries.
    pub fn from_document(doc: &Document) -> Self {
        let mut known = Self::default();
        let Some(dss) = existing_dss(doc) else {
            return known;
        };

        let mut arrays: Vec<&Object> = TokenKind::ALL
            .iter()
            .filter_map(|kind| dss.get(kind.dss_key().as_bytes()).ok())
            .collect();
        if let Some(vri) = deref_dict(doc, dss.get(b"VRI").ok()) {
            for (_, entry) in vri.iter() {
                if let Some(entry) = deref_dict(doc, Some(entry)) {
                    arrays.extend(
                        TokenKind::ALL
                            .iter()
                            .filter_map(|kind| entry.get(kind.vri_key().as_bytes()).ok()),
                    );
                }
            }
        }

        for array in arrays {
            let Ok((_, Object::Array(items))) = doc.dereference(array) else {
                continue;
            };
            for item in items {
                let Ok(id) = item.as_reference() else {
                    continue;
                };
                match stream_bytes(doc, id) {
                    Some(bytes) => {
                        known.objects.entry(Sha256::digest(&bytes).into()).or_insert(id);
                    }
                    None => log::debug!("DSS entry {} {} R is not a readable stream", id.0, id.1),
                }
            }
        }
        log::debug!("{} trust material objects already embedded", known.len());
        known
    }

    pub fn get(&self, digest: &ContentDigest) -> Option<ObjectId> {
        self.objects.get(digest).copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Result of [`extend_with_trust_material`].
#[derive(Debug)]
pub struct Extension {
    /// The extended document, or the input unchanged if nothing was added.
    pub bytes: Vec<u8>,
    /// Material that was skipped, one entry per rejected signature.
    pub warnings: Vec<Error>,
    /// How many new streams were embedded.
    pub added_objects: usize,
}

/// Appends a revision with the DSS dictionary extended by `material`.
///
/// Material already in the document, or required by more than one signature,
/// is embedded only once. Existing DSS entries are preserved.
pub fn extend_with_trust_material(
    pdf_bytes: &[u8],
    material: &[SignatureValidationData],
) -> Result<Extension> {
    let mut update = IncrementalUpdate::new(pdf_bytes)?;
    let mut builder = TrustMaterialDictionaryBuilder::new(&mut update);
    for data in material {
        builder.add(data);
    }
    let outcome = builder.finish()?;
    if !outcome.changed {
        log::debug!("no usable trust material, document left untouched");
        return Ok(Extension {
            bytes: pdf_bytes.to_vec(),
            warnings: outcome.warnings,
            added_objects: 0,
        });
    }

    let revision = update.finish()?;
    Ok(Extension {
        bytes: revision.bytes,
        warnings: outcome.warnings,
        added_objects: outcome.added_objects,
    })
}

struct BuildOutcome {
    changed: bool,
    warnings: Vec<Error>,
    added_objects: usize,
}

/// Accumulates validation material into one new DSS dictionary.
pub(crate) struct TrustMaterialDictionaryBuilder<'u, 'a> {
    update: &'u mut IncrementalUpdate<'a>,
    known: KnownObjectMap,
    written: HashMap<ContentDigest, ObjectId>,
    globals: BTreeMap<TokenKind, Vec<ObjectId>>,
    vri: Dictionary,
    warnings: Vec<Error>,
    accepted: usize,
}

impl<'u, 'a> TrustMaterialDictionaryBuilder<'u, 'a> {
    pub(crate) fn new(update: &'u mut IncrementalUpdate<'a>) -> Self {
        let doc = update.document();
        let known = KnownObjectMap::from_document(doc);

        let mut globals: BTreeMap<TokenKind, Vec<ObjectId>> = BTreeMap::new();
        let mut vri = Dictionary::new();
        if let Some(dss) = existing_dss(doc) {
            for kind in TokenKind::ALL {
                let refs = globals.entry(kind).or_default();
                if let Ok((_, Object::Array(items))) = dss
                    .get(kind.dss_key().as_bytes())
                    .and_then(|a| doc.dereference(a))
                {
                    refs.extend(items.iter().filter_map(|i| i.as_reference().ok()));
                }
            }
            if let Some(existing) = deref_dict(doc, dss.get(b"VRI").ok()) {
                vri = existing.clone();
            }
        }

        Self {
            update,
            known,
            written: HashMap::new(),
            globals,
            vri,
            warnings: Vec::new(),
            accepted: 0,
        }
    }

    /// Adds the material of one signature. Unreadable tokens reject the whole
    /// entry, which is reported as a warning.
    pub(crate) fn add(&mut self, data: &SignatureValidationData) {
        if let Some(err) = data.tokens.iter().find_map(|t| t.verify().err()) {
            log::warn!("skipping validation data of VRI {}: {err}", data.vri_key());
            self.warnings.push(err);
            return;
        }

        let mut entry: BTreeMap<TokenKind, Vec<ObjectId>> = BTreeMap::new();
        for token in &data.tokens {
            let id = self.object_for(token);
            push_unique(entry.entry(token.kind()).or_default(), id);
            push_unique(self.globals.entry(token.kind()).or_default(), id);
        }

        let mut vri_entry = Dictionary::new();
        for (kind, ids) in entry {
            vri_entry.set(kind.vri_key(), references(&ids));
        }
        self.vri.set(data.vri_key(), Object::Dictionary(vri_entry));
        self.accepted += 1;
    }

    fn object_for(&mut self, token: &TrustMaterialToken) -> ObjectId {
        if let Some(id) = self.known.get(token.digest()) {
            return id;
        }
        if let Some(&id) = self.written.get(token.digest()) {
            return id;
        }
        let id = self
            .update
            .add_object(Stream::new(Dictionary::new(), token.encoded().to_vec()));
        self.written.insert(*token.digest(), id);
        id
    }

    /// Writes the DSS dictionary and links it from the catalog. If no
    /// material was accepted the revision is left untouched.
    fn finish(self) -> Result<BuildOutcome> {
        if self.accepted == 0 {
            return Ok(BuildOutcome {
                changed: false,
                warnings: self.warnings,
                added_objects: 0,
            });
        }

        let mut dss = Dictionary::new();
        dss.set("Type", Object::Name(b"DSS".to_vec()));
        for (kind, ids) in &self.globals {
            if !ids.is_empty() {
                dss.set(kind.dss_key(), references(ids));
            }
        }
        dss.set("VRI", Object::Dictionary(self.vri));

        let root = self.update.root_id()?;
        let existing = self
            .update
            .document()
            .get_dictionary(root)?
            .get(b"DSS")
            .and_then(Object::as_reference)
            .ok();
        match existing {
            Some(dss_id) => *self.update.object_mut(dss_id)? = Object::Dictionary(dss),
            None => {
                let dss_id = self.update.add_object(dss);
                self.update
                    .dictionary_mut(root)?
                    .set("DSS", Object::Reference(dss_id));
            }
        }

        log::debug!(
            "DSS extended with {} new objects, {} reused",
            self.written.len(),
            self.known.len()
        );
        Ok(BuildOutcome {
            changed: true,
            warnings: self.warnings,
            added_objects: self.written.len(),
        })
    }
}

fn push_unique(ids: &mut Vec<ObjectId>, id: ObjectId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn references(ids: &[ObjectId]) -> Object {
    Object::Array(ids.iter().map(|&id| Object::Reference(id)).collect())
}

fn existing_dss(doc: &Document) -> Option<&Dictionary> {
    let catalog = doc.catalog().ok()?;
    deref_dict(doc, catalog.get(b"DSS").ok())
}

fn deref_dict<'d>(doc: &'d Document, object: Option<&'d Object>) -> Option<&'d Dictionary> {
    doc.dereference(object?).ok()?.1.as_dict().ok()
}

fn stream_bytes(doc: &Document, id: ObjectId) -> Option<Vec<u8>> {
    let stream = doc.get_object(id).ok()?.as_stream().ok()?;
    if stream.dict.has(b"Filter") {
        stream.decompressed_content().ok()
    } else {
        Some(stream.content.clone())
    }
}
