//! Proportional image resizing for screenshots and `read_image`, gated on
//! the current model's advertised `max_image_dimension`.

use image::imageops::FilterType;
use image::ImageFormat;

fn format_for_media_type(media_type: &str) -> Option<ImageFormat> {
    match media_type {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        _ => None,
    }
}

/// If `max_dim` is set and either dimension of `data` exceeds it, resize
/// proportionally so both dimensions are `<= max_dim` and re-encode in the
/// same format. Returns `None` when resizing isn't needed or the format
/// isn't one we can decode/re-encode, in which case callers should use the
/// original bytes unchanged.
pub fn resize_to_fit(data: &[u8], media_type: &str, max_dim: Option<u32>) -> Option<Vec<u8>> {
    let max_dim = max_dim?;
    if max_dim == 0 {
        return None;
    }
    let format = format_for_media_type(media_type)?;
    let img = image::load_from_memory_with_format(data, format).ok()?;
    if img.width() <= max_dim && img.height() <= max_dim {
        return None;
    }

    let resized = img.resize(max_dim, max_dim, FilterType::Lanczos3);
    let mut out = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut out), format)
        .ok()?;
    Some(out)
}
