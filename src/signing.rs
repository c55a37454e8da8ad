//! Signing a document in one incremental revision.
//!
//! The revision holds the signature dictionary with fixed width placeholders,
//! the signature field and its widget, an optional visible appearance, and any
//! stamps. Preparing it is deterministic for the same input and parameters, so
//! [`PdfSignatureService::digest`] and [`PdfSignatureService::sign`] can run
//! in two separate steps around a remote signer.

use std::io::{Read, Write};
use std::ops::Range;

use chrono::{DateTime, Utc};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::appearance::{
    EncodedFormat, PageGeometry, SignatureImage, SignatureImageAndPosition, SignerDetails,
    VisibleSignatureCompositor, VisualElement,
};
use crate::byte_range::{insert_signature, reserve_range, write_byte_range, ByteRange};
use crate::incremental::IncrementalUpdate;
use crate::placement::{resolve_page, should_place};
use crate::revisions::{signature_fields, SignatureField, TIMESTAMP_SUB_FILTER};
use crate::{format_pdf_date, text_string, Error, Result};

/// Produces the signature value over the digested bytes of a revision.
pub trait ExternalSigner {
    /// `content` yields the two signed segments in file order, once.
    fn sign(&mut self, content: &mut dyn Read) -> anyhow::Result<Vec<u8>>;
}

impl<F> ExternalSigner for F
where
    F: FnMut(&mut dyn Read) -> anyhow::Result<Vec<u8>>,
{
    fn sign(&mut self, content: &mut dyn Read) -> anyhow::Result<Vec<u8>> {
        self(content)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureType {
    #[default]
    Signature,
    DocumentTimestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest(self, mut content: impl Read) -> Result<Vec<u8>> {
        fn hash<D: Digest + Write>(content: &mut dyn Read) -> Result<Vec<u8>> {
            let mut hasher = D::new();
            std::io::copy(content, &mut hasher)?;
            Ok(hasher.finalize().to_vec())
        }
        match self {
            DigestAlgorithm::Sha256 => hash::<Sha256>(&mut content),
            DigestAlgorithm::Sha384 => hash::<Sha384>(&mut content),
            DigestAlgorithm::Sha512 => hash::<Sha512>(&mut content),
        }
    }
}

/// Everything a signing request configures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningParameters {
    pub signature_type: SignatureType,
    /// Written as `/M`, and the seed of a missing document `/ID`.
    pub signing_time: DateTime<Utc>,
    /// Ignored for document timestamps, which always use `ETSI.RFC3161`.
    pub sub_filter: String,
    pub signer_name: Option<String>,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
    /// An existing empty field to sign. A new field is created when unset.
    pub field_name: Option<String>,
    /// Bytes reserved for the signature value.
    pub signature_size: usize,
    pub digest_algorithm: DigestAlgorithm,
    /// DocMDP permission level, 1 to 3, for a certification signature.
    pub certification: Option<u8>,
    /// Common name of the signing certificate, for the appearance templates.
    pub common_name: Option<String>,
    pub visual: Option<VisualElement>,
    pub stamps: Vec<VisualElement>,
}

impl Default for SigningParameters {
    fn default() -> Self {
        Self {
            signature_type: SignatureType::Signature,
            signing_time: Utc::now(),
            sub_filter: "ETSI.CAdES.detached".into(),
            signer_name: None,
            reason: None,
            location: None,
            contact_info: None,
            field_name: None,
            signature_size: 9472,
            digest_algorithm: DigestAlgorithm::Sha256,
            certification: None,
            common_name: None,
            visual: None,
            stamps: Vec::new(),
        }
    }
}

/// An empty signature field to add with
/// [`PdfSignatureService::add_signature_field`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureFieldParameters {
    /// `Signature<n>` when unset.
    pub name: Option<String>,
    /// 1-based, negative counts from the last page.
    pub page: i32,
    /// Widget rectangle in PDF user space, invisible when unset.
    pub rect: Option<[f32; 4]>,
}

impl Default for SignatureFieldParameters {
    fn default() -> Self {
        Self {
            name: None,
            page: 1,
            rect: None,
        }
    }
}

/// A signing revision whose placeholders are in place and whose byte range is
/// already written. Only the signature value is missing.
struct PreparedRevision {
    bytes: Vec<u8>,
    byte_range: ByteRange,
    contents: Range<usize>,
}

impl PreparedRevision {
    fn into_signed(mut self, signature: &[u8]) -> Result<Vec<u8>> {
        insert_signature(&mut self.bytes, &self.contents, signature)?;
        Ok(self.bytes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PdfSignatureService {
    compositor: VisibleSignatureCompositor,
}

impl PdfSignatureService {
    pub fn new(compositor: VisibleSignatureCompositor) -> Self {
        Self { compositor }
    }

    /// Digest of the bytes [`Self::sign`] will cover with the same input.
    pub fn digest(&self, pdf_bytes: &[u8], params: &SigningParameters) -> Result<Vec<u8>> {
        let prepared = self.prepare(pdf_bytes, params)?;
        let digest = params
            .digest_algorithm
            .digest(prepared.byte_range.reader(&prepared.bytes)?);
        digest
    }

    /// Writes the revision again and fills in a signature value computed
    /// elsewhere over [`Self::digest`].
    pub fn sign(
        &self,
        pdf_bytes: &[u8],
        signature_value: &[u8],
        params: &SigningParameters,
    ) -> Result<Vec<u8>> {
        self.prepare(pdf_bytes, params)?.into_signed(signature_value)
    }

    /// Writes the revision and has `signer` produce its signature value.
    pub fn sign_with(
        &self,
        pdf_bytes: &[u8],
        params: &SigningParameters,
        signer: &mut dyn ExternalSigner,
    ) -> Result<Vec<u8>> {
        let prepared = self.prepare(pdf_bytes, params)?;
        let signature = {
            let mut content = prepared.byte_range.reader(&prepared.bytes)?;
            signer.sign(&mut content).map_err(Error::External)?
        };
        log::debug!("external signer returned {} bytes", signature.len());
        prepared.into_signed(&signature)
    }

    /// Names of the signature fields that have no value yet.
    pub fn available_signature_fields(&self, pdf_bytes: &[u8]) -> Result<Vec<String>> {
        let doc = Document::load_mem(pdf_bytes).map_err(Error::DocumentLoad)?;
        Ok(signature_fields(&doc)?
            .into_iter()
            .filter(|f| f.value.is_none())
            .map(|f| f.name)
            .collect())
    }

    /// Appends a revision with a new empty signature field.
    pub fn add_signature_field(
        &self,
        pdf_bytes: &[u8],
        field: &SignatureFieldParameters,
    ) -> Result<Vec<u8>> {
        let mut update = IncrementalUpdate::new(pdf_bytes)?;
        update.ensure_document_id(pdf_bytes);

        let existing = signature_fields(update.document())?;
        let name = match &field.name {
            Some(name) if existing.iter().any(|f| &f.name == name) => {
                return Err(Error::InvalidState(format!(
                    "a signature field named \"{name}\" already exists"
                )))
            }
            Some(name) => name.clone(),
            None => next_field_name(&existing),
        };

        let pages = page_ids(update.document());
        let page_id = resolve_page(field.page, pages.len())
            .map(|i| pages[i])
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "page {} does not exist, the document has {}",
                    field.page,
                    pages.len()
                ))
            })?;

        let widget = widget_dictionary(&name, page_id, field.rect.unwrap_or_default());
        let field_id = update.add_object(widget);
        register_field(&mut update, field_id, page_id)?;
        log::debug!("adding empty signature field \"{name}\"");
        Ok(update.finish()?.bytes)
    }

    fn prepare(&self, pdf_bytes: &[u8], params: &SigningParameters) -> Result<PreparedRevision> {
        if params.sub_filter.is_empty() {
            return Err(Error::InvalidState("empty sub-filter".into()));
        }
        if let Some(level) = params.certification {
            if !(1..=3).contains(&level) {
                return Err(Error::InvalidState(format!(
                    "certification level {level} is not between 1 and 3"
                )));
            }
        }
        let placeholder = reserve_range(params.signature_size)?;
        let is_timestamp = params.signature_type == SignatureType::DocumentTimestamp;

        let mut update = IncrementalUpdate::new(pdf_bytes)?;
        update.ensure_document_id(params.signing_time.to_rfc3339().as_bytes());

        let pages = page_ids(update.document());
        if pages.is_empty() {
            return Err(Error::Structural("document has no pages".into()));
        }
        let fields = signature_fields(update.document())?;
        let previously_signed = fields.iter().any(|f| f.value.is_some());

        let target = match &params.field_name {
            Some(name) => {
                let field = fields
                    .iter()
                    .find(|f| &f.name == name)
                    .ok_or_else(|| Error::SignatureFieldNotFound(name.clone()))?;
                if field.value.is_some() {
                    return Err(Error::SignatureFieldAlreadySigned(name.clone()));
                }
                Some(existing_field(update.document(), field)?)
            }
            None => None,
        };

        let mut signature = signature_dictionary(params, is_timestamp);
        let certify = match params.certification {
            Some(_) if is_timestamp => {
                log::warn!("document timestamps can not certify, ignoring the certification level");
                None
            }
            Some(_) if previously_signed => {
                log::warn!("document is already signed, it can not be certified anymore");
                None
            }
            level => level,
        };
        if let Some(level) = certify {
            signature.set(
                "Reference",
                vec![Object::Dictionary(dictionary! {
                    "Type" => "SigRef",
                    "TransformMethod" => "DocMDP",
                    "TransformParams" => dictionary! {
                        "Type" => "TransformParams",
                        "P" => Object::Integer(level as i64),
                        "V" => "1.2",
                    },
                })],
            );
        }
        let signature_id = update.add_object(signature);
        update.reserve_signature(signature_id, placeholder)?;

        if certify.is_some() {
            let root_id = update.root_id()?;
            update
                .dictionary_mut(root_id)?
                .set("Perms", dictionary! { "DocMDP" => signature_id });
        }

        let signer = SignerDetails {
            common_name: params.common_name.clone(),
            signing_time: Some(params.signing_time),
        };
        let visual = params.visual.as_ref().filter(|_| !is_timestamp);

        match target {
            Some((field_id, page_id, rect)) => {
                let page_id = page_id.unwrap_or(pages[0]);
                let stream = match (visual, rect) {
                    (Some(element), Some([llx, lly, urx, ury])) => {
                        // The widget keeps its rectangle, the appearance is
                        // scaled into it.
                        let page = page_geometry(update.document(), page_id)?;
                        match self.visible_appearance(element, &signer, &page)? {
                            Some(composed) => Some(embed_appearance(
                                &mut update,
                                &composed.image,
                                urx - llx,
                                ury - lly,
                            )?),
                            None => None,
                        }
                    }
                    (Some(_), None) => {
                        log::warn!("field has no visible widget, signing invisibly");
                        None
                    }
                    _ => None,
                };
                let field = update.dictionary_mut(field_id)?;
                field.set("V", signature_id);
                if let Some(form_id) = stream {
                    field.set("AP", dictionary! { "N" => form_id });
                }
                set_signature_flags(&mut update)?;
            }
            None => {
                let name = next_field_name(&fields);
                let element_page = match visual {
                    Some(element) => resolve_page(element.page, pages.len()),
                    None => Some(0),
                };
                let (page_id, visual) = match element_page {
                    Some(index) => (pages[index], visual),
                    None => {
                        log::warn!("visible signature page does not exist, signing invisibly");
                        (pages[0], None)
                    }
                };

                let page = page_geometry(update.document(), page_id)?;
                let appearance = match visual {
                    Some(element) => self.visible_appearance(element, &signer, &page)?,
                    None => None,
                };
                let (rect, stream) = match &appearance {
                    Some(composed) => {
                        let rect = composed.placement.to_pdf_rect(&page);
                        let form_id = embed_appearance(
                            &mut update,
                            &composed.image,
                            composed.placement.width,
                            composed.placement.height,
                        )?;
                        (rect, Some(form_id))
                    }
                    None => ([0.0; 4], None),
                };

                let mut widget = widget_dictionary(&name, page_id, rect);
                widget.set("V", signature_id);
                if let Some(form_id) = stream {
                    widget.set("AP", dictionary! { "N" => form_id });
                }
                let field_id = update.add_object(widget);
                register_field(&mut update, field_id, page_id)?;
                log::debug!("signing new field \"{name}\"");
            }
        }

        if is_timestamp {
            if !params.stamps.is_empty() {
                log::debug!("document timestamps carry no stamps, skipping them");
            }
        } else {
            self.place_stamps(&mut update, &params.stamps, &signer, &pages)?;
        }

        let revision = update.finish()?;
        let offsets = revision.placeholder.ok_or_else(|| {
            Error::InvalidState("signature placeholder was not written".into())
        })?;
        let mut bytes = revision.bytes;
        let byte_range = ByteRange::around_placeholder(bytes.len(), &offsets.contents)?;
        write_byte_range(&mut bytes, &offsets.byte_range, &byte_range)?;
        log::debug!("prepared revision with byte range {:?}", byte_range.0);

        Ok(PreparedRevision {
            bytes,
            byte_range,
            contents: offsets.contents,
        })
    }

    /// Composes an element. A bad configuration only costs the element.
    fn visible_appearance(
        &self,
        element: &VisualElement,
        signer: &SignerDetails,
        page: &PageGeometry,
    ) -> Result<Option<SignatureImageAndPosition>> {
        match self.compositor.compose(element, signer, page) {
            Ok(composed) => Ok(Some(composed)),
            Err(e) if !e.is_fatal() => {
                log::warn!("dropping visual element: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Adds a stamp, its popup, and a link over it on every page each stamp
    /// is placed on.
    fn place_stamps(
        &self,
        update: &mut IncrementalUpdate,
        stamps: &[VisualElement],
        signer: &SignerDetails,
        pages: &[ObjectId],
    ) -> Result<()> {
        for (n, stamp) in stamps.iter().enumerate() {
            for (index, &page_id) in pages.iter().enumerate() {
                if !should_place(index, pages.len(), stamp) {
                    continue;
                }
                let page = page_geometry(update.document(), page_id)?;
                let Some(composed) = self.visible_appearance(stamp, signer, &page)? else {
                    continue;
                };
                let rect = rect_object(composed.placement.to_pdf_rect(&page));
                let form_id = embed_appearance(
                    update,
                    &composed.image,
                    composed.placement.width,
                    composed.placement.height,
                )?;

                let stamp_id = update.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Stamp",
                    "Rect" => rect.clone(),
                    "P" => page_id,
                    "F" => Object::Integer(4),
                    "NM" => text_string(&format!("stamp{}-{}", n + 1, index + 1)),
                    "AP" => dictionary! { "N" => form_id },
                });
                let popup_id = update.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Popup",
                    "Rect" => rect.clone(),
                    "P" => page_id,
                    "Parent" => stamp_id,
                    "Open" => false,
                });
                update.dictionary_mut(stamp_id)?.set("Popup", popup_id);
                let link_id = update.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Link",
                    "Rect" => rect,
                    "P" => page_id,
                    "Border" => vec![0.into(), 0.into(), 0.into()],
                });

                let annotations = [stamp_id, popup_id, link_id];
                for id in annotations {
                    append_to_array(update, page_id, None, b"Annots", id.into())?;
                }
                update.include(annotations)?;
                log::debug!("stamp {} placed on page {}", n + 1, index + 1);
            }
        }
        Ok(())
    }
}

fn signature_dictionary(params: &SigningParameters, is_timestamp: bool) -> Dictionary {
    let mut dict = Dictionary::new();
    if is_timestamp {
        dict.set("Type", "DocTimeStamp");
        dict.set("Filter", "Adobe.PPKLite");
        dict.set("SubFilter", Object::Name(TIMESTAMP_SUB_FILTER.to_vec()));
    } else {
        dict.set("Type", "Sig");
        dict.set("Filter", "Adobe.PPKLite");
        dict.set("SubFilter", Object::Name(params.sub_filter.as_bytes().to_vec()));
        dict.set(
            "M",
            Object::string_literal(format_pdf_date(&params.signing_time)),
        );
        let metadata = [
            ("Name", &params.signer_name),
            ("Reason", &params.reason),
            ("Location", &params.location),
            ("ContactInfo", &params.contact_info),
        ];
        for (key, value) in metadata {
            if let Some(value) = value {
                dict.set(key, text_string(value));
            }
        }
    }
    // Written as placeholders.
    dict.set("ByteRange", vec![0.into(), 0.into(), 0.into(), 0.into()]);
    dict.set("Contents", Object::String(Vec::new(), StringFormat::Hexadecimal));
    dict
}

fn widget_dictionary(name: &str, page_id: ObjectId, rect: [f32; 4]) -> Dictionary {
    dictionary! {
        "FT" => "Sig",
        "Type" => "Annot",
        "Subtype" => "Widget",
        "F" => Object::Integer(132),
        "T" => text_string(name),
        "P" => page_id,
        "Rect" => rect_object(rect),
    }
}

fn rect_object(rect: [f32; 4]) -> Object {
    Object::Array(rect.into_iter().map(Object::Real).collect())
}

/// First `Signature<n>` not taken yet.
fn next_field_name(fields: &[SignatureField]) -> String {
    (1..)
        .map(|n| format!("Signature{n}"))
        .find(|name| fields.iter().all(|f| &f.name != name))
        .unwrap_or_default()
}

/// The field object, its page, and its widget rectangle when it has a
/// visible one. Only fields merged with their widget get an appearance.
fn existing_field(
    doc: &Document,
    field: &SignatureField,
) -> Result<(ObjectId, Option<ObjectId>, Option<[f32; 4]>)> {
    let id = field.id.ok_or_else(|| {
        Error::Structural(format!(
            "signature field \"{}\" is not an indirect object",
            field.name
        ))
    })?;
    let dict = doc.get_dictionary(id)?;
    let page = dict.get(b"P").and_then(Object::as_reference).ok();
    let rect = dict
        .get(b"Rect")
        .and_then(|r| doc.dereference(r))
        .and_then(|(_, r)| r.as_array())
        .ok()
        .and_then(|r| <[f32; 4]>::try_from(r.iter().filter_map(number).collect::<Vec<_>>()).ok())
        .filter(|[llx, lly, urx, ury]| urx > llx && ury > lly);
    Ok((id, page, rect))
}

fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}

/// Media box and rotation of a page, inherited from the page tree when the
/// page does not set them.
fn page_geometry(doc: &Document, page_id: ObjectId) -> Result<PageGeometry> {
    let read_box = |dict: &Dictionary, key: &[u8]| {
        dict.get(key)
            .and_then(|b| doc.dereference(b))
            .and_then(|(_, b)| b.as_array())
            .ok()
            .and_then(|b| {
                let values: Vec<f32> = b
                    .iter()
                    .filter_map(|v| doc.dereference(v).ok().and_then(|(_, v)| number(v)))
                    .collect();
                <[f32; 4]>::try_from(values).ok()
            })
    };

    let mut media_box = None;
    let mut crop_box = None;
    let mut rotation = None;
    let mut node = Some(page_id);
    let mut depth = 0;
    while let Some(id) = node {
        depth += 1;
        if depth > 64 || (media_box.is_some() && crop_box.is_some() && rotation.is_some()) {
            break;
        }
        let dict = doc.get_dictionary(id)?;
        media_box = media_box.or_else(|| read_box(dict, b"MediaBox"));
        crop_box = crop_box.or_else(|| read_box(dict, b"CropBox"));
        if rotation.is_none() {
            rotation = dict.get(b"Rotate").and_then(Object::as_i64).ok();
        }
        node = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    let geometry = PageGeometry::from_media_box(
        media_box.unwrap_or([0.0, 0.0, 612.0, 792.0]),
        rotation.unwrap_or(0),
    );
    Ok(match crop_box {
        Some(crop_box) => geometry.with_crop_box(crop_box),
        None => geometry,
    })
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Embeds the raster as an image XObject drawn by a form XObject of the
/// displayed size, and returns the form.
fn embed_appearance(
    update: &mut IncrementalUpdate,
    image: &SignatureImage,
    width: f32,
    height: f32,
) -> Result<ObjectId> {
    let (pixels_wide, pixels_high) = image.raster.dimensions();
    let mut dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => Object::Integer(pixels_wide as i64),
        "Height" => Object::Integer(pixels_high as i64),
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => Object::Integer(8),
    };
    let content = match image.format {
        EncodedFormat::Jpeg => {
            dict.set("Filter", "DCTDecode");
            image.encoded.clone()
        }
        EncodedFormat::Png => {
            let mut rgb = Vec::with_capacity(image.raster.len() / 4 * 3);
            let mut alpha = Vec::with_capacity(image.raster.len() / 4);
            for pixel in image.raster.pixels() {
                rgb.extend_from_slice(&pixel.0[..3]);
                alpha.push(pixel.0[3]);
            }
            let mask_id = update.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => Object::Integer(pixels_wide as i64),
                    "Height" => Object::Integer(pixels_high as i64),
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => Object::Integer(8),
                    "Filter" => "FlateDecode",
                },
                deflate(&alpha)?,
            ));
            dict.set("SMask", mask_id);
            dict.set("Filter", "FlateDecode");
            deflate(&rgb)?
        }
    };
    let image_id = update.add_object(Stream::new(dict, content));

    let form = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => rect_object([0.0, 0.0, width, height]),
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Img0" => image_id },
            },
        },
        format!("q {width} 0 0 {height} 0 0 cm /Img0 Do Q").into_bytes(),
    );
    Ok(update.add_object(form))
}

/// Appends `item` to the array under `key` in the dictionary `holder`, or in
/// its direct sub-dictionary `nested`. An indirect array is rewritten where it
/// is, a missing one is created.
fn append_to_array(
    update: &mut IncrementalUpdate,
    holder: ObjectId,
    nested: Option<&[u8]>,
    key: &[u8],
    item: Object,
) -> Result<()> {
    let current = {
        let dict = update.document().get_dictionary(holder)?;
        let dict = match nested {
            Some(name) => dict.get(name)?.as_dict()?,
            None => dict,
        };
        dict.get(key).ok().cloned()
    };

    match current {
        Some(Object::Reference(array_id)) => {
            update.object_mut(array_id)?.as_array_mut()?.push(item);
        }
        None | Some(Object::Array(_)) => {
            let dict = update.dictionary_mut(holder)?;
            let dict = match nested {
                Some(name) => dict.get_mut(name)?.as_dict_mut()?,
                None => dict,
            };
            let has_array = matches!(dict.get(key), Ok(Object::Array(_)));
            if has_array {
                dict.get_mut(key)?.as_array_mut()?.push(item);
            } else {
                dict.set(key.to_vec(), vec![item]);
            }
        }
        Some(_) => {
            return Err(Error::Structural(format!(
                "/{} is not an array",
                String::from_utf8_lossy(key)
            )))
        }
    }
    Ok(())
}

/// Adds a field to the interactive form, creating the form if needed, and
/// its widget to the page's annotations.
fn register_field(update: &mut IncrementalUpdate, field_id: ObjectId, page_id: ObjectId) -> Result<()> {
    let root_id = update.root_id()?;
    let acro_form = update
        .document()
        .get_dictionary(root_id)?
        .get(b"AcroForm")
        .ok()
        .cloned();
    match acro_form {
        None => {
            let form_id = update.add_object(dictionary! {
                "Fields" => vec![field_id.into()],
                "SigFlags" => Object::Integer(3),
            });
            update.dictionary_mut(root_id)?.set("AcroForm", form_id);
        }
        Some(Object::Reference(form_id)) => {
            append_to_array(update, form_id, None, b"Fields", field_id.into())?;
        }
        Some(Object::Dictionary(_)) => {
            append_to_array(update, root_id, Some(b"AcroForm"), b"Fields", field_id.into())?;
        }
        Some(_) => return Err(Error::Structural("/AcroForm is not a dictionary".into())),
    }
    set_signature_flags(update)?;
    append_to_array(update, page_id, None, b"Annots", field_id.into())
}

/// `/SigFlags 3`: the document has signatures and must only be appended to.
fn set_signature_flags(update: &mut IncrementalUpdate) -> Result<()> {
    let root_id = update.root_id()?;
    let acro_form = update
        .document()
        .get_dictionary(root_id)?
        .get(b"AcroForm")
        .ok()
        .cloned();
    let form = match acro_form {
        Some(Object::Reference(form_id)) => update.dictionary_mut(form_id)?,
        Some(Object::Dictionary(_)) => update
            .dictionary_mut(root_id)?
            .get_mut(b"AcroForm")?
            .as_dict_mut()?,
        _ => return Err(Error::Structural("document has no interactive form".into())),
    };
    if form.get(b"SigFlags").and_then(Object::as_i64).ok() != Some(3) {
        form.set("SigFlags", Object::Integer(3));
    }
    Ok(())
}
