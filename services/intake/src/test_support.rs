use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// A small solid-colour PNG
pub fn sample_png(value: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(8, 8, Rgb([value, value, value]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode sample png");
    bytes
}
