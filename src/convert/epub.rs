//! Fixed-layout EPUB 3 with one image per page

use chrono::Utc;
use quick_xml::escape::escape;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::errors::ConversionResult;

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

struct EpubPage {
    number: usize,
    width: u32,
    height: u32,
    image: Vec<u8>,
}

pub(super) fn write_epub(pages: &[PathBuf], title: &str, file: &mut File) -> ConversionResult<()> {
    let mut epub_pages = Vec::with_capacity(pages.len());
    for (index, path) in pages.iter().enumerate() {
        let (width, height) = image::image_dimensions(path)?;
        epub_pages.push(EpubPage {
            number: index + 1,
            width,
            height,
            image: std::fs::read(path)?,
        });
    }

    let mut writer = zip::ZipWriter::new(file);
    let stored = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

    // Must be the first entry and uncompressed
    writer.start_file("mimetype", stored)?;
    writer.write_all(b"application/epub+zip")?;

    writer.start_file("META-INF/container.xml", deflated)?;
    writer.write_all(CONTAINER_XML.as_bytes())?;

    writer.start_file("OEBPS/content.opf", deflated)?;
    writer.write_all(package_document(title, &epub_pages).as_bytes())?;

    writer.start_file("OEBPS/nav.xhtml", deflated)?;
    writer.write_all(navigation_document(title).as_bytes())?;

    for page in &epub_pages {
        writer.start_file(format!("OEBPS/pages/page-{}.xhtml", page.number), deflated)?;
        writer.write_all(page_document(title, page).as_bytes())?;

        writer.start_file(format!("OEBPS/images/{}.jpg", page.number), stored)?;
        writer.write_all(&page.image)?;
    }

    writer.finish()?;
    Ok(())
}

fn package_document(title: &str, pages: &[EpubPage]) -> String {
    let mut manifest = String::from(
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
"#,
    );
    let mut spine = String::new();

    for page in pages {
        let cover = if page.number == 1 {
            r#" properties="cover-image""#
        } else {
            ""
        };
        manifest.push_str(&format!(
            "    <item id=\"img-{n}\" href=\"images/{n}.jpg\" media-type=\"image/jpeg\"{cover}/>\n    <item id=\"page-{n}\" href=\"pages/page-{n}.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            n = page.number
        ));
        spine.push_str(&format!("    <itemref idref=\"page-{}\"/>\n", page.number));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id" xml:lang="ja">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">urn:uuid:{id}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>ja</dc:language>
    <meta property="dcterms:modified">{modified}</meta>
    <meta property="rendition:layout">pre-paginated</meta>
    <meta property="rendition:spread">landscape</meta>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine page-progression-direction="rtl">
{spine}  </spine>
</package>
"#,
        id = uuid::Uuid::new_v4(),
        title = escape(title),
        modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

fn navigation_document(title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>{title}</title></head>
<body>
  <nav epub:type="toc"><ol><li><a href="pages/page-1.xhtml">{title}</a></li></ol></nav>
</body>
</html>
"#,
        title = escape(title)
    )
}

fn page_document(title: &str, page: &EpubPage) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <title>{title}</title>
  <meta name="viewport" content="width={width}, height={height}"/>
  <style>html, body {{ margin: 0; padding: 0; }} img {{ width: 100%; height: 100%; }}</style>
</head>
<body><img src="../images/{number}.jpg" alt="{number}"/></body>
</html>
"#,
        title = escape(title),
        width = page.width,
        height = page.height,
        number = page.number
    )
}
