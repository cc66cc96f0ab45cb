//! Builds PDFs with one page per image.
//!
//! Every image becomes a page of exactly its own pixel size, embedded as
//! JPEG. When a password is given, streams are encrypted through
//! [`SecurityHandler`].

use crate::errors::{JmError, Result};
use crate::package::pdf_security::SecurityHandler;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use log::{debug, info, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, StringFormat};

const JPEG_QUALITY: u8 = 90;

/// One page, ready to embed.
#[derive(Debug, Clone)]
pub struct PdfPage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PdfPage {
    /// Decodes any supported image format and re-encodes it as JPEG.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes)?;
        let (width, height) = img.dimensions();
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

        let mut jpeg = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(
            &mut Cursor::new(&mut jpeg),
            JPEG_QUALITY,
        ))?;

        Ok(Self {
            jpeg,
            width,
            height,
        })
    }
}

fn name(n: &str) -> Object {
    Object::Name(n.as_bytes().to_vec())
}

fn int(n: impl Into<i64>) -> Object {
    Object::Integer(n.into())
}

/// Serialises `pages` into a PDF document.
pub fn write_pdf(pages: &[PdfPage], password: Option<&str>) -> Result<Vec<u8>> {
    if pages.is_empty() {
        return Err(JmError::Pdf("no pages to write".into()));
    }

    let security = password.map(|pw| SecurityHandler::new(pw, pw)).transpose()?;
    let seal = |data: Vec<u8>| -> Result<Vec<u8>> {
        match &security {
            Some(s) => s.encrypt_stream(&data),
            None => Ok(data),
        }
    };

    let mut doc = Document::with_version(if security.is_some() { "2.0" } else { "1.7" });
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for page in pages {
        let mut image_dict = Dictionary::new();
        image_dict.set("Type", name("XObject"));
        image_dict.set("Subtype", name("Image"));
        image_dict.set("Width", int(page.width));
        image_dict.set("Height", int(page.height));
        image_dict.set("ColorSpace", name("DeviceRGB"));
        image_dict.set("BitsPerComponent", int(8));
        image_dict.set("Filter", name("DCTDecode"));
        let image_id = doc.add_object(Object::Stream(Stream::new(image_dict, seal(page.jpeg.clone())?)));

        let content = format!("q {} 0 0 {} 0 0 cm /Im0 Do Q", page.width, page.height);
        let content_id = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            seal(content.into_bytes())?,
        )));

        let mut xobjects = Dictionary::new();
        xobjects.set("Im0", Object::Reference(image_id));
        let mut resources = Dictionary::new();
        resources.set("XObject", Object::Dictionary(xobjects));

        let mut page_dict = Dictionary::new();
        page_dict.set("Type", name("Page"));
        page_dict.set("Parent", Object::Reference(pages_id));
        page_dict.set(
            "MediaBox",
            Object::Array(vec![int(0), int(0), int(page.width), int(page.height)]),
        );
        page_dict.set("Resources", Object::Dictionary(resources));
        page_dict.set("Contents", Object::Reference(content_id));

        let page_id: ObjectId = doc.add_object(Object::Dictionary(page_dict));
        kids.push(Object::Reference(page_id));
    }

    let mut pages_dict = Dictionary::new();
    pages_dict.set("Type", name("Pages"));
    pages_dict.set("Count", int(i64::try_from(kids.len()).unwrap_or(i64::MAX)));
    pages_dict.set("Kids", Object::Array(kids));
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let mut catalog = Dictionary::new();
    catalog.set("Type", name("Catalog"));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let file_id: [u8; 16] = rand::random();
    let id_string = || Object::String(file_id.to_vec(), StringFormat::Hexadecimal);
    doc.trailer.set("ID", Object::Array(vec![id_string(), id_string()]));

    if let Some(s) = &security {
        let encrypt_id = doc.add_object(Object::Dictionary(s.encrypt_dictionary()));
        doc.trailer.set("Encrypt", Object::Reference(encrypt_id));
    }

    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| JmError::Pdf(e.to_string()))?;

    Ok(out)
}

/// Builds a PDF at `out` from image files, in the given order.
///
/// Nothing is left at `out` if any image fails to convert.
pub async fn build_pdf(images: Vec<PathBuf>, password: Option<String>, out: PathBuf) -> Result<PathBuf> {
    info!("Building {} from {} images", out.display(), images.len());

    let target = out.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let pages = images
            .iter()
            .map(|path| {
                debug!("Converting {}", path.display());
                PdfPage::from_image_bytes(&std::fs::read(path)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let bytes = write_pdf(&pages, password.as_deref())?;
        std::fs::write(&target, bytes)?;
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(out),
        Ok(Err(e)) => {
            remove_partial(&out).await;
            Err(e)
        }
        Err(e) => {
            remove_partial(&out).await;
            Err(JmError::Join(e))
        }
    }
}

async fn remove_partial(out: &Path) {
    if tokio::fs::remove_file(out).await.is_ok() {
        warn!("Removed partial pdf {}", out.display());
    }
}
