// Raster encoding helpers: PNG in and out, 16-bit label export, data-URLs.

pub mod image_helper {
    use crate::core_modules::labeling::LabelMatrix;
    use crate::error::{PrepError, Result};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{DynamicImage, ImageBuffer, ImageEncoder, ImageFormat, Luma, RgbaImage};
    use std::io::Cursor;

    const DATA_URL_PNG_PREFIX: &str = "data:image/png;base64,";

    /// Encodes an RGBA raster as PNG bytes.
    pub fn encode_png(raster: &RgbaImage) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut bytes);
        encoder.write_image(
            raster.as_raw(),
            raster.width(),
            raster.height(),
            image::ExtendedColorType::Rgba8,
        )?;
        Ok(bytes)
    }

    pub fn decode_png(bytes: &[u8]) -> Result<RgbaImage> {
        Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgba8())
    }

    /// Lossless 16-bit grayscale PNG of a label matrix. Labels above 65535 saturate.
    pub fn encode_labels(labels: &LabelMatrix) -> Result<Vec<u8>> {
        let values: Vec<u16> = labels
            .as_slice()
            .iter()
            .map(|&label| label.min(u16::MAX as u32) as u16)
            .collect();
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(labels.width(), labels.height(), values)
                .ok_or_else(|| PrepError::InvalidParameter("label matrix has an inconsistent size".into()))?;
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma16(buffer).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    pub fn to_data_url(png: &[u8]) -> String {
        format!("{DATA_URL_PNG_PREFIX}{}", STANDARD.encode(png))
    }

    pub fn is_data_url(value: &str) -> bool {
        value.trim_start().starts_with("data:")
    }

    /// Decodes the payload of a base64 data-URL. Any media type is accepted.
    pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
        let (_, payload) = url
            .split_once(";base64,")
            .ok_or_else(|| PrepError::CorruptSidecar("data-URL is not base64 encoded".into()))?;
        STANDARD
            .decode(payload.trim())
            .map_err(|e| PrepError::CorruptSidecar(format!("invalid base64 payload: {e}")))
    }
}
