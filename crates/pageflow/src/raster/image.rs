use std::io::Cursor;

use crate::error::RasterError;

/// Decodes any supported image format and re-encodes it as PNG.
pub(super) fn normalize_to_png(bytes: &[u8]) -> Result<Vec<u8>, RasterError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| RasterError::ImageProcessing(format!("Failed to load image: {}", e)))?;

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| RasterError::ImageProcessing(format!("Failed to encode PNG: {}", e)))?;
    Ok(png)
}
