//! PDF with one full-page JPEG XObject per page and an optional outline

use image::{ColorType, ImageDecoder, ImageReader};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId, Stream, StringFormat, dictionary};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::ConversionResult;
use crate::storage::LibraryLayout;

/// Top-level bookmark pointing at a 1-based page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct OutlineEntry {
    pub title: String,
    pub page: usize,
}

/// Parse the table of contents stored next to the pages; a missing file is an empty outline
pub(super) fn read_outline(page_dir: &Path) -> ConversionResult<Vec<OutlineEntry>> {
    let contents = match std::fs::read_to_string(LibraryLayout::toc_path(page_dir)) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for line in contents.lines().filter(|line| !line.trim().is_empty()) {
        let parsed = line.split_once('\t').and_then(|(title, page)| {
            let page = page.trim().parse::<usize>().ok()?;
            Some(OutlineEntry {
                title: title.trim().to_string(),
                page,
            })
        });
        match parsed {
            Some(entry) => entries.push(entry),
            None => debug!("Ignoring malformed table of contents line {:?}", line),
        }
    }
    Ok(entries)
}

/// PDF text string: literal for ASCII, UTF-16BE with a byte order mark otherwise
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        return Object::string_literal(text);
    }
    let mut bytes = vec![0xFE, 0xFF];
    bytes.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
    Object::String(bytes, StringFormat::Hexadecimal)
}

/// Link entries into a flat outline; entries pointing past the last page are dropped
fn add_outline(
    document: &mut Document,
    page_ids: &[ObjectId],
    entries: &[OutlineEntry],
) -> Option<ObjectId> {
    let targets: Vec<(&OutlineEntry, ObjectId)> = entries
        .iter()
        .filter_map(|entry| {
            let page_id = page_ids.get(entry.page.checked_sub(1)?)?;
            Some((entry, *page_id))
        })
        .collect();
    if targets.is_empty() {
        return None;
    }

    let outlines_id = document.new_object_id();
    let item_ids: Vec<ObjectId> = targets.iter().map(|_| document.new_object_id()).collect();

    for (index, (entry, page_id)) in targets.iter().enumerate() {
        let destination: Vec<Object> = vec![(*page_id).into(), "Fit".into()];
        let mut item = dictionary! {
            "Title" => text_string(&entry.title),
            "Parent" => outlines_id,
            "Dest" => destination,
        };
        if index > 0 {
            item.set("Prev", item_ids[index - 1]);
        }
        if let Some(next) = item_ids.get(index + 1) {
            item.set("Next", *next);
        }
        document.objects.insert(item_ids[index], Object::Dictionary(item));
    }

    let count = item_ids.len() as i64;
    document.objects.insert(
        outlines_id,
        Object::Dictionary(dictionary! {
            "Type" => "Outlines",
            "First" => item_ids[0],
            "Last" => item_ids[item_ids.len() - 1],
            "Count" => count,
        }),
    );
    Some(outlines_id)
}

struct PageImage {
    width: i64,
    height: i64,
    color_space: &'static str,
    data: Vec<u8>,
}

fn load_page(path: &Path) -> ConversionResult<PageImage> {
    let decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let (width, height) = decoder.dimensions();
    let color_space = match decoder.color_type() {
        ColorType::L8 | ColorType::L16 => "DeviceGray",
        _ => "DeviceRGB",
    };

    Ok(PageImage {
        width: i64::from(width),
        height: i64::from(height),
        color_space,
        data: std::fs::read(path)?,
    })
}

pub(super) fn write_pdf(
    pages: &[PathBuf],
    title: &str,
    outline: &[OutlineEntry],
    file: &mut File,
) -> ConversionResult<()> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let mut page_ids: Vec<ObjectId> = Vec::with_capacity(pages.len());

    for path in pages {
        let page = load_page(path)?;
        let image_id = document.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => page.width,
                "Height" => page.height,
                "ColorSpace" => page.color_space,
                "BitsPerComponent" => 8_i64,
                "Filter" => "DCTDecode",
            },
            page.data,
        ));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        page.width.into(),
                        0_i64.into(),
                        0_i64.into(),
                        page.height.into(),
                        0_i64.into(),
                        0_i64.into(),
                    ],
                ),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = document.add_object(Stream::new(dictionary! {}, content.encode()?));

        let media_box: Vec<Object> = vec![
            0_i64.into(),
            0_i64.into(),
            page.width.into(),
            page.height.into(),
        ];
        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => media_box,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        page_ids.push(page_id);
    }

    let count = page_ids.len() as i64;
    let kids: Vec<Object> = page_ids.iter().map(|id| (*id).into()).collect();
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let info_id = document.add_object(dictionary! {
        "Title" => text_string(title),
    });
    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    if let Some(outlines_id) = add_outline(&mut document, &page_ids, outline) {
        catalog.set("Outlines", outlines_id);
        catalog.set("PageMode", "UseOutlines");
    }
    let catalog_id = document.add_object(catalog);
    document.trailer.set("Root", catalog_id);
    document.trailer.set("Info", info_id);

    document.save_to(file)?;
    Ok(())
}
