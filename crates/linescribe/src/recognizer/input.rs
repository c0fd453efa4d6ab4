//! Line image to network input conversion.
//!
//! A grayscale strip is scaled to the network's input height, contrast
//! normalized so its darkest pixel maps to -1 and its lightest to +1, and padded
//! on the right (by repeating the last column) to a multiple of the network's
//! time reduction. Column `x` of the strip becomes timestep `x`; row `y`
//! becomes feature `y`.

use crate::network::NetworkIO;
use crate::{LinescribeError, Result};
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::GrayImage;
use ndarray::Array2;

/// A line ready for the forward pass.
#[derive(Debug, Clone)]
pub struct PreparedLine {
    pub input: NetworkIO,
    /// Scaled width divided by original width.
    pub scale: f32,
    /// Width in pixels after scaling, before padding.
    pub scaled_width: usize,
    /// The strip had a single gray level.
    pub blank: bool,
}

/// Scale, normalize and pad `image` for a network with input depth `height`.
pub fn prepare_line(
    image: &GrayImage,
    height: usize,
    x_scale: usize,
    max_width: Option<usize>,
    invert: bool,
) -> Result<PreparedLine> {
    let (width, image_height) = image.dimensions();
    if width == 0 || image_height == 0 {
        return Err(LinescribeError::image_processing("line image has no pixels"));
    }
    if height == 0 {
        return Err(LinescribeError::validation("network input height must be at least 1"));
    }
    let scale = height as f32 / image_height as f32;
    let scaled_width = ((width as f32 * scale).round() as usize).max(1);
    if let Some(max) = max_width
        && scaled_width > max
    {
        return Err(LinescribeError::recognition(format!(
            "line is {scaled_width} px wide after scaling, more than max_line_width {max}"
        )));
    }

    let mut pixels = if scaled_width == width as usize && height == image_height as usize {
        image.as_raw().clone()
    } else {
        resize_gray(image, scaled_width as u32, height as u32)?
    };
    if invert {
        pixels.iter_mut().for_each(|p| *p = 255 - *p);
    }

    let black = pixels.iter().copied().min().unwrap_or(0);
    let white = pixels.iter().copied().max().unwrap_or(255);
    let blank = black == white;
    let contrast = if blank { 1.0 } else { f32::from(white - black) };

    let x_scale = x_scale.max(1);
    let padded_width = scaled_width.div_ceil(x_scale) * x_scale;
    let mut data = Array2::<f32>::zeros((padded_width, height));
    for x in 0..padded_width {
        let src_x = x.min(scaled_width - 1);
        for y in 0..height {
            let p = pixels[y * scaled_width + src_x];
            data[[x, y]] = f32::from(p - black) / contrast * 2.0 - 1.0;
        }
    }

    Ok(PreparedLine {
        input: NetworkIO::from_array(data),
        scale,
        scaled_width,
        blank,
    })
}

fn resize_gray(image: &GrayImage, width: u32, height: u32) -> Result<Vec<u8>> {
    let src = Image::from_vec_u8(image.width(), image.height(), image.as_raw().clone(), PixelType::U8)
        .map_err(|e| LinescribeError::image_processing_with_source("cannot wrap line image", e))?;
    let mut dst = Image::new(width, height, PixelType::U8);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| LinescribeError::image_processing_with_source("cannot scale line image", e))?;
    Ok(dst.into_vec())
}
