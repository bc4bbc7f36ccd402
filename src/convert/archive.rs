//! Zip of the raw page images

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use zip::CompressionMethod;

use crate::errors::ConversionResult;

pub(super) fn write_image_archive(pages: &[PathBuf], file: &mut File) -> ConversionResult<()> {
    let mut writer = zip::ZipWriter::new(file);
    // JPEG data does not compress further
    let options =
        zip::write::FileOptions::<()>::default().compression_method(CompressionMethod::Stored);

    for page in pages {
        let name = page
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        writer.start_file(name, options)?;
        writer.write_all(&std::fs::read(page)?)?;
    }

    writer.finish()?;
    Ok(())
}
