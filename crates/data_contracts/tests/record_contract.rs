use data_contracts::proto::{Example, Feature, Features};
use data_contracts::record::{KEY_BBOX_XMAX, KEY_BBOX_XMIN, KEY_BBOX_YMAX, KEY_BBOX_YMIN, KEY_LABEL};
use data_contracts::{BoundingBox, ContractError, ImageRecord, MISSING_LABEL};
use prost::Message;
use std::collections::HashMap;

#[test]
fn invalid_bbox_rejected() {
    let record = ImageRecord::new(vec![1, 2, 3], 4, "cat")
        .with_boxes(vec![BoundingBox::new(0.8, 0.2, 0.1, 0.9)]);
    let err = record.validate().unwrap_err();
    assert!(matches!(err, ContractError::InvalidBbox(_)));
}

#[test]
fn valid_record_passes() {
    let record = ImageRecord::new(vec![1, 2, 3], 4, "cat")
        .with_boxes(vec![BoundingBox::new(0.1, 0.1, 0.2, 0.2)]);
    assert!(record.validate().is_ok());
}

#[test]
fn empty_image_rejected_by_writer_checks() {
    let record = ImageRecord::new(Vec::new(), 0, "dog");
    assert!(matches!(record.validate(), Err(ContractError::MissingImage)));
}

#[test]
fn record_survives_encoding() -> anyhow::Result<()> {
    let record = ImageRecord::new(vec![9; 16], 7, "tabby")
        .with_boxes(vec![BoundingBox::new(0.1, 0.2, 0.6, 0.9)]);
    let decoded = ImageRecord::decode(&record.encode_to_vec())?;
    assert_eq!(decoded, record);
    assert_eq!(decoded.boxes[0].yx(), [0.2, 0.1, 0.9, 0.6]);
    Ok(())
}

#[test]
fn missing_features_use_defaults() -> anyhow::Result<()> {
    let bytes = Example::default().encode_to_vec();
    let decoded = ImageRecord::decode(&bytes)?;
    assert_eq!(decoded.label, MISSING_LABEL);
    assert!(decoded.text.is_empty());
    assert!(decoded.encoded.is_empty());
    assert!(decoded.boxes.is_empty());
    Ok(())
}

#[test]
fn wrong_feature_kind_is_an_error() {
    let mut feature = HashMap::new();
    feature.insert(KEY_LABEL.to_string(), Feature::floats(vec![1.0]));
    let example = Example {
        features: Some(Features { feature }),
    };
    let err = ImageRecord::from_example(&example).unwrap_err();
    assert!(matches!(err, ContractError::FeatureKind { .. }));
}

#[test]
fn ragged_bbox_lists_are_an_error() {
    let mut feature = HashMap::new();
    feature.insert(KEY_BBOX_XMIN.to_string(), Feature::floats(vec![0.1, 0.2]));
    feature.insert(KEY_BBOX_YMIN.to_string(), Feature::floats(vec![0.1]));
    feature.insert(KEY_BBOX_XMAX.to_string(), Feature::floats(vec![0.5, 0.6]));
    feature.insert(KEY_BBOX_YMAX.to_string(), Feature::floats(vec![0.5, 0.6]));
    let example = Example {
        features: Some(Features { feature }),
    };
    let err = ImageRecord::from_example(&example).unwrap_err();
    assert!(matches!(err, ContractError::BboxLengthMismatch { ymin: 1, .. }));
}

#[test]
fn garbage_bytes_fail_to_decode() {
    let err = ImageRecord::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
    assert!(matches!(err, ContractError::Decode(_)));
}
