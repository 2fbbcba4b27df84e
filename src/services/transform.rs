//! Image transforms over byte streams.
//!
//! A stage takes encoded image bytes and produces encoded image bytes in the
//! same format. `apply_transforms` chains stages left to right behind a
//! single output stream; nothing runs until the stream is polled.
//!
//! Decode/encode is CPU-bound and runs on the blocking pool.

use crate::services::blob_stream::{ByteStream, collect_bytes};
use bytes::Bytes;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use std::io::{self, Cursor};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unrecognised image format: {0}")]
    UnknownFormat(#[source] image::ImageError),
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image as {format:?}: {source}")]
    Encode {
        format: ImageFormat,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid resize target {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// One step of an image pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TransformStage {
    /// Gaussian blur with the given sigma.
    Blur { sigma: f32 },
    /// Scale to cover `width`x`height` and centre-crop to exactly that size.
    Resize { width: u32, height: u32 },
}

impl TransformStage {
    /// Run this stage over one encoded image.
    pub fn apply(&self, input: &[u8]) -> Result<Bytes, TransformError> {
        let format = image::guess_format(input).map_err(TransformError::UnknownFormat)?;
        let img = image::load_from_memory_with_format(input, format)
            .map_err(TransformError::Decode)?;

        let out = match *self {
            Self::Blur { sigma } => img.blur(sigma),
            Self::Resize { width, height } => {
                if width == 0 || height == 0 {
                    return Err(TransformError::InvalidSize { width, height });
                }
                img.resize_to_fill(width, height, FilterType::Triangle)
            }
        };

        encode(&out, format)
    }
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Bytes, TransformError> {
    // JPEG has no alpha channel.
    let img = if format == ImageFormat::Jpeg && img.color().has_alpha() {
        DynamicImage::ImageRgb8(img.to_rgb8())
    } else {
        img.clone()
    };

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)
        .map_err(|source| TransformError::Encode { format, source })?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Run `stages` in order over one encoded image.
pub fn run_stages(input: Bytes, stages: &[TransformStage]) -> Result<Bytes, TransformError> {
    stages.iter().try_fold(input, |bytes, stage| {
        let out = stage.apply(&bytes)?;
        debug!(?stage, in_len = bytes.len(), out_len = out.len(), "transform stage applied");
        Ok(out)
    })
}

/// Compose `stages` over `source` into a single pull-through stream.
///
/// Transform failures surface as `io::Error`s on the returned stream, so a
/// consumer writing it to storage aborts the write.
pub fn apply_transforms(source: ByteStream, stages: Vec<TransformStage>) -> ByteStream {
    if stages.is_empty() {
        return source;
    }

    futures::stream::once(async move {
        let input = collect_bytes(source).await?;
        tokio::task::spawn_blocking(move || run_stages(input, &stages))
            .await
            .map_err(|e| io::Error::other(format!("transform task panicked: {e}")))?
            .map_err(io::Error::other)
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_stream::bytes_stream;
    use image::{GenericImageView, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        Bytes::from(buf.into_inner())
    }

    #[tokio::test]
    async fn resize_yields_exact_dimensions() {
        let out = apply_transforms(
            bytes_stream(png(400, 300)),
            vec![TransformStage::Resize {
                width: 100,
                height: 100,
            }],
        );
        let bytes = collect_bytes(out).await.unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (100, 100));
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn stages_compose_left_to_right() {
        let out = run_stages(
            png(64, 32),
            &[
                TransformStage::Resize {
                    width: 20,
                    height: 10,
                },
                TransformStage::Blur { sigma: 2.0 },
                TransformStage::Resize { width: 5, height: 5 },
            ],
        )
        .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (5, 5));
    }

    #[test]
    fn blur_keeps_dimensions_and_changes_pixels() {
        let input = png(32, 32);
        let out = TransformStage::Blur { sigma: 3.0 }.apply(&input).unwrap();
        let before = image::load_from_memory(&input).unwrap();
        let after = image::load_from_memory(&out).unwrap();
        assert_eq!(after.dimensions(), (32, 32));
        assert_ne!(before.to_rgb8().into_raw(), after.to_rgb8().into_raw());
    }

    #[test]
    fn jpeg_input_stays_jpeg() {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(40, 40))
            .write_to(&mut buf, ImageFormat::Jpeg)
            .unwrap();
        let out = TransformStage::Resize {
            width: 10,
            height: 10,
        }
        .apply(&buf.into_inner())
        .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn garbage_input_fails_the_stream() {
        let out = apply_transforms(
            bytes_stream("definitely not an image"),
            vec![TransformStage::Blur { sigma: 1.0 }],
        );
        let err = collect_bytes(out).await.unwrap_err();
        assert!(err.to_string().contains("unrecognised image format"));
    }

    #[test]
    fn zero_sized_resize_is_rejected() {
        let err = TransformStage::Resize { width: 0, height: 5 }
            .apply(&png(8, 8))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidSize { .. }));
    }

    #[tokio::test]
    async fn no_stages_passes_bytes_through() {
        let out = apply_transforms(bytes_stream("raw"), Vec::new());
        assert_eq!(collect_bytes(out).await.unwrap().as_ref(), b"raw");
    }
}
