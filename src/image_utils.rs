use crate::model_service::InputShape;
use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageReader};
use ndarray::{Array3, Array4, ArrayD, Axis, Ix4};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Error decoding image: {0}")]
    Decode(String),
    #[error("Expected input of shape {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Unsupported channel count: {0}")]
    Channels(u32),
}

fn image_reader(image_data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ImageError> {
    ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| ImageError::Decode(e.to_string()))
}

pub fn decode_image(image_data: &[u8]) -> Result<DynamicImage, ImageError> {
    image_reader(image_data)?
        .decode()
        .map_err(|e| ImageError::Decode(e.to_string()))
}

/// Reads only the header, so a wrongly sized upload is refused before its
/// pixel buffer is allocated.
pub fn check_dimensions(image_data: &[u8], shape: &InputShape) -> Result<(), ImageError> {
    let (width, height) = image_reader(image_data)?
        .into_dimensions()
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    if (width, height) != (shape.width, shape.height) {
        return Err(ImageError::Shape {
            expected: shape.as_hwc().to_vec(),
            actual: vec![height as usize, width as usize],
        });
    }
    Ok(())
}

/// Converts a decoded image into an `(H, W, C)` array of raw pixel values.
///
/// The pixel format is coerced to the expected channel count. Spatial size is
/// only changed when `resize` is set; otherwise it has to match exactly.
pub fn image_to_array(
    img: &DynamicImage,
    shape: &InputShape,
    resize: bool,
) -> Result<Array3<f32>, ImageError> {
    let resized;
    let img = if resize && img.dimensions() != (shape.width, shape.height) {
        resized = img.resize_exact(shape.width, shape.height, FilterType::CatmullRom);
        &resized
    } else {
        img
    };

    let (width, height) = img.dimensions();
    if (width, height) != (shape.width, shape.height) {
        return Err(ImageError::Shape {
            expected: shape.as_hwc().to_vec(),
            actual: vec![height as usize, width as usize, img.color().channel_count() as usize],
        });
    }

    let raw = match shape.channels {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        4 => img.to_rgba8().into_raw(),
        other => return Err(ImageError::Channels(other)),
    };

    Array3::from_shape_vec(shape.as_hwc(), raw.into_iter().map(f32::from).collect()).map_err(
        |_| ImageError::Shape {
            expected: shape.as_hwc().to_vec(),
            actual: vec![height as usize, width as usize],
        },
    )
}

/// Prepends the batch axis. Only a single `(H, W, C)` image is accepted;
/// arrays of any other rank, including already batched ones, are rejected.
pub fn add_batch_dimension(
    array: ArrayD<f32>,
    shape: &InputShape,
) -> Result<Array4<f32>, ImageError> {
    let shape_error = |actual: &[usize]| ImageError::Shape {
        expected: shape.as_hwc().to_vec(),
        actual: actual.to_vec(),
    };

    if array.shape() != &shape.as_hwc()[..] {
        return Err(shape_error(array.shape()));
    }

    let actual = array.shape().to_vec();
    array
        .insert_axis(Axis(0))
        .into_dimensionality::<Ix4>()
        .map_err(|_| shape_error(&actual))
}

pub fn preprocess(
    image_data: &[u8],
    shape: &InputShape,
    resize: bool,
) -> Result<Array4<f32>, ImageError> {
    if !resize {
        check_dimensions(image_data, shape)?;
    }

    let img = decode_image(image_data)?;
    let array = image_to_array(&img, shape, resize)?;
    add_batch_dimension(array.into_dyn(), shape)
}
