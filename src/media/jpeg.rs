use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;

use super::remote::{ChunkDecoder, DecodeStep};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, PartialEq, Eq)]
enum JpegScan {
    /// `start..end` holds one whole image.
    Complete { start: usize, end: usize },
    /// An image begins at `start` but its end marker has not arrived.
    Partial { start: usize },
    Missing,
}

fn find_marker(data: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

fn scan(data: &[u8]) -> JpegScan {
    let Some(start) = find_marker(data, &SOI, 0) else {
        return JpegScan::Missing;
    };
    match find_marker(data, &EOI, start + 2) {
        Some(eoi) => JpegScan::Complete {
            start,
            end: eoi + 2,
        },
        None => JpegScan::Partial { start },
    }
}

/// Decodes a byte stream of back-to-back JPEG images, such as an MJPEG feed
/// with or without multipart boundaries. Anything between images is skipped.
///
/// Images carrying an embedded EXIF thumbnail end at the thumbnail's end
/// marker and come out as corrupt frames.
#[derive(Debug, Default)]
pub struct JpegStreamDecoder;

impl JpegStreamDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkDecoder for JpegStreamDecoder {
    fn decode(&mut self, data: &[u8]) -> DecodeStep {
        match scan(data) {
            // Keep a trailing 0xFF, it may be the first half of a start marker.
            JpegScan::Missing => DecodeStep::NeedMore {
                consumed: data.len().saturating_sub(1),
            },
            JpegScan::Partial { start } => DecodeStep::NeedMore { consumed: start },
            JpegScan::Complete { start, end } => {
                let encoded = Vector::<u8>::from_slice(&data[start..end]);
                match imgcodecs::imdecode(&encoded, imgcodecs::IMREAD_COLOR) {
                    Ok(image) if image.rows() > 0 && image.cols() > 0 => DecodeStep::Frame {
                        image,
                        consumed: end,
                    },
                    Ok(_) => DecodeStep::Corrupt {
                        consumed: end,
                        reason: "jpeg decoded to an empty image".to_string(),
                    },
                    Err(e) => DecodeStep::Corrupt {
                        consumed: end,
                        reason: e.to_string(),
                    },
                }
            }
        }
    }
}
