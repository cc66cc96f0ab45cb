//! Reassembles images that were cut into horizontal strips.
//!
//! The uploader cut each image into `n` full-width strips, the first one
//! taking the leftover `height % n` rows, and stacked them in reverse.
//! Reading the strips back to front and writing them front to back
//! restores the original.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Pixel, imageops};
use log::trace;

use crate::errors::Result;

/// Descrambles encoded image bytes, returning bytes in the same format.
///
/// A `strip_count` of `0` means the image was never scrambled, and the
/// input is handed back untouched.
pub fn descramble(bytes: &[u8], strip_count: u32) -> Result<Vec<u8>> {
    if strip_count == 0 {
        return Ok(bytes.to_vec());
    }

    let format = image::guess_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = img.dimensions();

    trace!("descrambling {width}x{height} {format:?} image into {strip_count} strips");

    let out = descramble_image(&img, strip_count);
    encode(out, format)
}

/// Descrambles a decoded image. See the [module docs](self) for the layout.
///
/// Images shorter than `strip_count` rows can't have been cut that way
/// and are returned as they are.
pub fn descramble_image(img: &DynamicImage, strip_count: u32) -> DynamicImage {
    if strip_count == 0 || img.height() < strip_count {
        return img.clone();
    }

    match img {
        DynamicImage::ImageLuma8(b) => DynamicImage::ImageLuma8(reassemble(b, strip_count)),
        DynamicImage::ImageLumaA8(b) => DynamicImage::ImageLumaA8(reassemble(b, strip_count)),
        DynamicImage::ImageRgb8(b) => DynamicImage::ImageRgb8(reassemble(b, strip_count)),
        DynamicImage::ImageRgba8(b) => DynamicImage::ImageRgba8(reassemble(b, strip_count)),
        DynamicImage::ImageRgb16(b) => DynamicImage::ImageRgb16(reassemble(b, strip_count)),
        DynamicImage::ImageRgba16(b) => DynamicImage::ImageRgba16(reassemble(b, strip_count)),
        other => DynamicImage::ImageRgba8(reassemble(&other.to_rgba8(), strip_count)),
    }
}

/// Where strip `i` of `n` is read from and written to, as
/// `(source_top, destination_top, height)`.
pub(crate) fn strip_geometry(height: u32, strip_count: u32, i: u32) -> (u32, u32, u32) {
    let remainder = height % strip_count;
    let strip_height = height / strip_count;

    let source_top = height - strip_height * (i + 1) - remainder;

    if i == 0 {
        (source_top, 0, strip_height + remainder)
    } else {
        (source_top, strip_height * i + remainder, strip_height)
    }
}

fn reassemble<P>(
    src: &ImageBuffer<P, Vec<P::Subpixel>>,
    strip_count: u32,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
{
    let (width, height) = src.dimensions();
    let mut canvas = ImageBuffer::<P, Vec<P::Subpixel>>::new(width, height);

    for i in 0..strip_count {
        let (source_top, destination_top, strip_height) = strip_geometry(height, strip_count, i);
        let strip = imageops::crop_imm(src, 0, source_top, width, strip_height).to_image();

        imageops::replace(&mut canvas, &strip, 0, i64::from(destination_top));
    }

    canvas
}

fn encode(img: DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    // jpeg has no alpha channel and the webp encoder only takes 8-bit rgb(a)
    let img = match format {
        ImageFormat::Jpeg
            if !matches!(img, DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_)) =>
        {
            DynamicImage::ImageRgb8(img.to_rgb8())
        }
        ImageFormat::WebP
            if !matches!(img, DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_)) =>
        {
            DynamicImage::ImageRgba8(img.to_rgba8())
        }
        _ => img,
    };

    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), format)?;

    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use image::{Rgb, RgbImage};

    /// The uploader's side: moves every band to where the descrambler reads it from.
    pub(crate) fn scramble_image(src: &RgbImage, strip_count: u32) -> RgbImage {
        let (width, height) = src.dimensions();
        if strip_count == 0 || height < strip_count {
            return src.clone();
        }

        let mut out = RgbImage::new(width, height);
        for i in 0..strip_count {
            let (source_top, destination_top, strip_height) =
                strip_geometry(height, strip_count, i);
            let band = imageops::crop_imm(src, 0, destination_top, width, strip_height).to_image();

            imageops::replace(&mut out, &band, 0, i64::from(source_top));
        }

        out
    }

    /// Every row gets a distinct colour so any misplaced row shows up.
    pub(crate) fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(y % 256) as u8, (y / 256) as u8, (x % 256) as u8])
        })
    }

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn geometry_partitions_the_image() {
        for (height, n) in [(37, 2), (37, 8), (1000, 18), (18, 18), (100, 10)] {
            let mut sources = vec![false; height as usize];
            let mut destinations = vec![false; height as usize];

            for i in 0..n {
                let (s, d, h) = strip_geometry(height, n, i);
                for row in 0..h {
                    assert!(!std::mem::replace(&mut sources[(s + row) as usize], true));
                    assert!(!std::mem::replace(&mut destinations[(d + row) as usize], true));
                }
            }

            assert!(sources.iter().all(|&b| b), "height={height} n={n}");
            assert!(destinations.iter().all(|&b| b), "height={height} n={n}");
        }
    }

    #[test]
    fn round_trip_restores_every_pixel() {
        let original = gradient(7, 301);

        for n in [0, 2, 8, 18] {
            let scrambled = png_bytes(scramble_image(&original, n));
            let restored = descramble(&scrambled, n).unwrap();
            let restored = image::load_from_memory(&restored).unwrap().to_rgb8();

            assert_eq!(restored, original, "strip_count={n}");
        }
    }

    #[test]
    fn scrambled_image_differs_from_original() {
        let original = gradient(3, 40);
        assert_ne!(scramble_image(&original, 8), original);
    }

    #[test]
    fn zero_is_identity() {
        let bytes = png_bytes(gradient(4, 9));
        assert_eq!(descramble(&bytes, 0).unwrap(), bytes);
    }

    #[test]
    fn shorter_than_strip_count_is_copied() {
        let original = gradient(4, 5);
        let restored = descramble(&png_bytes(original.clone()), 8).unwrap();

        assert_eq!(image::load_from_memory(&restored).unwrap().to_rgb8(), original);
    }

    #[test]
    fn keeps_the_input_format() {
        let bytes = png_bytes(gradient(2, 20));
        let out = descramble(&bytes, 2).unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(descramble(b"definitely not an image", 4).is_err());
    }
}
