//! Two-pass decoding: read the header for the native size, pick a sample factor, then decode
//! at the reduced size.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Seek};
use std::path::Path;

use fast_image_resize as fir;
use image::{ImageFormat, ImageReader, RgbaImage, imageops};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use tracing::debug;

use crate::error::LoadError;
use crate::events::{DecodedImage, RequiredSize};
use crate::processing::layout::{reduced_size, sample_factor};

/// Turns encoded bytes into an image no larger than needed for a target.
///
/// Implementations run on blocking threads.
pub trait Downsampler: Send + Sync + 'static {
    fn decode_file(&self, path: &Path, required: RequiredSize) -> Result<DecodedImage, LoadError>;

    fn decode_bytes(&self, bytes: &[u8], required: RequiredSize)
    -> Result<DecodedImage, LoadError>;
}

/// Default [`Downsampler`] built on `image`.
///
/// JPEGs are decoded straight at (close to) the reduced size through DCT scaling, so the
/// full-resolution bitmap is never built. Other formats are decoded and then reduced.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaledDecoder;

impl Downsampler for ScaledDecoder {
    fn decode_file(&self, path: &Path, required: RequiredSize) -> Result<DecodedImage, LoadError> {
        decode(Encoded::File(path), required)
    }

    fn decode_bytes(
        &self,
        bytes: &[u8],
        required: RequiredSize,
    ) -> Result<DecodedImage, LoadError> {
        decode(Encoded::Memory(bytes), required)
    }
}

trait ReadSeek: BufRead + Seek {}

impl<T: BufRead + Seek> ReadSeek for T {}

#[derive(Clone, Copy)]
enum Encoded<'a> {
    File(&'a Path),
    Memory(&'a [u8]),
}

impl<'a> Encoded<'a> {
    /// A fresh reader positioned at the start; every pass opens its own.
    fn open(&self) -> io::Result<Box<dyn ReadSeek + 'a>> {
        match *self {
            Encoded::File(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            Encoded::Memory(bytes) => Ok(Box::new(Cursor::new(bytes))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Encoded::File(path) => path.display().to_string(),
            Encoded::Memory(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

fn decode(encoded: Encoded<'_>, required: RequiredSize) -> Result<DecodedImage, LoadError> {
    // Pass one: header only.
    let reader = ImageReader::new(encoded.open()?).with_guessed_format()?;
    let format = reader.format();
    let native = reader.into_dimensions()?;
    let factor = sample_factor(native, required);
    let target = reduced_size(native, factor);
    debug!(
        source = %encoded.describe(),
        ?native,
        ?target,
        factor,
        "decoding downsampled"
    );

    // Pass two: the pixels.
    let mut rgba = None;
    if factor > 1 && format == Some(ImageFormat::Jpeg) {
        match decode_jpeg_scaled(encoded, target) {
            Ok(img) => rgba = Some(img),
            Err(err) => debug!(
                source = %encoded.describe(),
                "scaled JPEG decode failed, falling back: {err}"
            ),
        }
    }
    let rgba = match rgba {
        Some(img) => img,
        None => ImageReader::new(encoded.open()?)
            .with_guessed_format()?
            .decode()?
            .to_rgba8(),
    };

    let rgba = if rgba.dimensions() != target {
        resize_rgba(&rgba, target.0, target.1)?
    } else {
        rgba
    };

    let orientation = read_orientation(encoded).unwrap_or(1);
    Ok(DecodedImage::new(apply_orientation(rgba, orientation)))
}

fn decode_jpeg_scaled(encoded: Encoded<'_>, target: (u32, u32)) -> Result<RgbaImage, LoadError> {
    let mut decoder = JpegDecoder::new(encoded.open()?);
    let request_w = target.0.clamp(1, u16::MAX as u32) as u16;
    let request_h = target.1.clamp(1, u16::MAX as u32) as u16;
    decoder.scale(request_w, request_h)?;
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| LoadError::Decode("missing JPEG info after decode".into()))?;
    let width = info.width as u32;
    let height = info.height as u32;

    let rgba = match info.pixel_format {
        PixelFormat::RGB24 => {
            let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
            for chunk in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            rgba
        }
        PixelFormat::L8 => {
            let mut rgba = Vec::with_capacity(pixels.len() * 4);
            for &v in &pixels {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        PixelFormat::CMYK32 => {
            let mut rgba = Vec::with_capacity(pixels.len());
            for chunk in pixels.chunks_exact(4) {
                let k = chunk[3] as f32 / 255.0;
                let channel = |v: u8| {
                    let c = (v as f32 / 255.0) * (1.0 - k) + k;
                    ((1.0 - c) * 255.0).round().clamp(0.0, 255.0) as u8
                };
                rgba.extend_from_slice(&[
                    channel(chunk[0]),
                    channel(chunk[1]),
                    channel(chunk[2]),
                    255,
                ]);
            }
            rgba
        }
        PixelFormat::L16 => {
            return Err(LoadError::Decode(
                "16-bit grayscale JPEGs are not supported by the scaled decoder".into(),
            ));
        }
    };

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| LoadError::Decode("scaled JPEG buffer has the wrong length".into()))
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, LoadError> {
    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| LoadError::Decode(format!("cannot view source for resize: {err}")))?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| LoadError::Decode(format!("resize failed: {err}")))?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| LoadError::Decode("resized buffer has the wrong length".into()))
}

fn read_orientation(encoded: Encoded<'_>) -> Option<u16> {
    let mut reader = encoded.open().ok()?;
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = field.value.get_uint(0)? as u16;
    debug!(source = %encoded.describe(), orientation, "exif orientation");
    Some(orientation)
}

fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        // transpose
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        // transverse
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}
