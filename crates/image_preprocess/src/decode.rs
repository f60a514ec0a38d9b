//! Record and image decoding.

use crate::tensor::ImageTensor;
use crate::types::{PreprocessError, PreprocessResult, Sample};
use data_contracts::ImageRecord;

/// Parses one serialized `tf.train.Example`.
pub fn decode_record(bytes: &[u8]) -> PreprocessResult<Sample> {
    let record = ImageRecord::decode(bytes)?;
    let label = i32::try_from(record.label).map_err(|_| {
        PreprocessError::Parse(format!("label {} does not fit in i32", record.label))
    })?;
    Ok(Sample {
        encoded: record.encoded,
        label,
        bboxes: record.boxes.iter().map(|b| b.yx()).collect(),
        text: record.text,
    })
}

/// Decodes JPEG/PNG bytes into `channels` float channels in `[0, 1]`.
pub fn decode_image(encoded: &[u8], channels: usize) -> PreprocessResult<ImageTensor> {
    if encoded.is_empty() {
        return Err(PreprocessError::ImageFormat("record has no image bytes".to_string()));
    }
    let img = image::load_from_memory(encoded)?;
    let channels = if channels == 1 { 1 } else { 3 };
    ImageTensor::from_dynamic(&img, channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_contracts::{BoundingBox, MISSING_LABEL};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, _| Rgb([(x * 40) as u8, 128, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn decodes_record_with_boxes() {
        let rec = ImageRecord::new(vec![1, 2, 3], 7, "tabby")
            .with_boxes(vec![BoundingBox::new(0.1, 0.2, 0.3, 0.4)]);
        let sample = decode_record(&rec.encode_to_vec()).unwrap();
        assert_eq!(sample.label, 7);
        assert_eq!(sample.text, "tabby");
        assert_eq!(sample.bboxes, vec![[0.2, 0.1, 0.4, 0.3]]);
        assert_eq!(sample.bbox_shape(), [1, 1, 4]);
    }

    #[test]
    fn missing_label_defaults() {
        let rec = data_contracts::Example::default();
        let bytes = prost::Message::encode_to_vec(&rec);
        let sample = decode_record(&bytes).unwrap();
        assert_eq!(sample.label as i64, MISSING_LABEL);
        assert!(sample.text.is_empty());
        assert_eq!(sample.bbox_shape(), [1, 0, 4]);
    }

    #[test]
    fn malformed_bytes_fail_to_parse() {
        assert!(matches!(
            decode_record(&[0xff, 0xff, 0xff, 0xff]),
            Err(PreprocessError::Contract(_))
        ));
    }

    #[test]
    fn decodes_png_into_requested_channels() {
        let bytes = png(5, 3);
        let rgb = decode_image(&bytes, 3).unwrap();
        assert_eq!((rgb.height(), rgb.width(), rgb.channels()), (3, 5, 3));
        assert!((rgb.at(0, 0, 2) - 1.0).abs() < 1e-6);
        let gray = decode_image(&bytes, 1).unwrap();
        assert_eq!(gray.channels(), 1);
        assert!(decode_image(b"not an image", 3).is_err());
    }
}
