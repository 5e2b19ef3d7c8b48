use std::io::Cursor;

use candle_core::{DType, Device, IndexOp, Tensor};
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::{Error, Result};

/// One generated picture, 8 bits per channel RGB.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(self.pixels.clone())
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.to_dynamic()
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(bytes)
    }
}

/// Turns a decoder batch into images.
///
/// Values are clipped to [0, 1], the batch is reshaped to
/// (batch, height, width, 3) and quantized to 8 bits.
pub fn images_from_batch(decoded: &Tensor, height: usize, width: usize) -> Result<Vec<DecodedImage>> {
    let batch = decoded.dim(0)?;
    let pixels = decoded
        .to_dtype(DType::F32)?
        .clamp(0f32, 1f32)?
        .reshape((batch, height, width, 3))?;
    let pixels = (pixels * 255.0)?.round()?.to_dtype(DType::U8)?.to_device(&Device::Cpu)?;
    (0..batch)
        .map(|i| {
            let raw = pixels.i(i)?.flatten_all()?.to_vec1::<u8>()?;
            let buffer = RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
                Error::Tensor(candle_core::Error::msg("error converting tensor to image buffer"))
            })?;
            Ok(DecodedImage::new(buffer))
        })
        .collect()
}
