//! In-memory fixtures shared by the unit tests.

use std::io::Read;

use lopdf::{dictionary, Dictionary, Document, Object, Stream};

/// A minimal document with `pages` US Letter pages.
pub(crate) fn sample_pdf(pages: usize) -> Vec<u8> {
    sample_pdf_with_rotation(pages, 0)
}

pub(crate) fn sample_pdf_with_rotation(pages: usize, rotate: i64) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for i in 0..pages {
        let content = Stream::new(
            Dictionary::new(),
            format!("0 0 m {} 100 l S", 100 + i).into_bytes(),
        );
        let content_id = doc.add_object(content);
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => Object::Integer(pages as i64),
            "Rotate" => Object::Integer(rotate),
            "MediaBox" => Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ]),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// Stands in for a CMS signer: a short DER sequence whose payload is the
/// length of the content it was given.
pub(crate) fn fake_signer(content: &mut dyn Read) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    content.read_to_end(&mut data)?;
    let len = (data.len() as u32).to_be_bytes();
    Ok(vec![0x30, 0x04, len[0], len[1], len[2], len[3]])
}

/// TrueType font shipped with the test data.
pub(crate) fn test_font() -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("test_data/fonts/DejaVuSans.ttf");
    std::fs::read(path).unwrap()
}
