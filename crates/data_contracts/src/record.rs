use crate::proto::{feature, Example, Feature, Features};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const KEY_ENCODED: &str = "image/encoded";
pub const KEY_LABEL: &str = "image/class/label";
pub const KEY_TEXT: &str = "image/class/text";
pub const KEY_BBOX_XMIN: &str = "image/object/bbox/xmin";
pub const KEY_BBOX_YMIN: &str = "image/object/bbox/ymin";
pub const KEY_BBOX_XMAX: &str = "image/object/bbox/xmax";
pub const KEY_BBOX_YMAX: &str = "image/object/bbox/ymax";

/// Label used when a record carries no `image/class/label`.
pub const MISSING_LABEL: i64 = -1;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("feature {key} has kind {found}, expected {expected}")]
    FeatureKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("feature {key} holds {len} values, expected at most one")]
    FeatureLength { key: String, len: usize },
    #[error("feature {key} is not valid utf-8")]
    InvalidUtf8 { key: String },
    #[error("bbox coordinate lists differ in length: xmin={xmin} ymin={ymin} xmax={xmax} ymax={ymax}")]
    BboxLengthMismatch {
        xmin: usize,
        ymin: usize,
        xmax: usize,
        ymax: usize,
    },
    #[error("bbox out of range or inverted: {0:?}")]
    InvalidBbox(BoundingBox),
    #[error("record has no encoded image")]
    MissingImage,
}

/// Normalized box in the `x/y min/max` layout the record stores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Coordinates reordered to `[y_min, x_min, y_max, x_max]`.
    pub fn yx(&self) -> [f32; 4] {
        [self.ymin, self.xmin, self.ymax, self.xmax]
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        let coords = [self.xmin, self.ymin, self.xmax, self.ymax];
        let in_range = coords.iter().all(|v| !v.is_nan() && (0.0..=1.0).contains(v));
        if !in_range || self.xmin > self.xmax || self.ymin > self.ymax {
            return Err(ContractError::InvalidBbox(*self));
        }
        Ok(())
    }
}

/// One classification sample as stored in a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub encoded: Vec<u8>,
    pub label: i64,
    pub text: String,
    pub boxes: Vec<BoundingBox>,
}

impl ImageRecord {
    pub fn new(encoded: Vec<u8>, label: i64, text: impl Into<String>) -> Self {
        Self {
            encoded,
            label,
            text: text.into(),
            boxes: Vec::new(),
        }
    }

    pub fn with_boxes(mut self, boxes: Vec<BoundingBox>) -> Self {
        self.boxes = boxes;
        self
    }

    /// Checks applied by shard writers; readers stay permissive.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.encoded.is_empty() {
            return Err(ContractError::MissingImage);
        }
        for b in &self.boxes {
            b.validate()?;
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContractError> {
        let example = Example::decode(bytes)?;
        Self::from_example(&example)
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.to_example().encode_to_vec()
    }

    /// Missing fields fall back to defaults: empty bytes/strings, label `-1`, no boxes.
    pub fn from_example(example: &Example) -> Result<Self, ContractError> {
        let empty = HashMap::new();
        let map = example
            .features
            .as_ref()
            .map(|f| &f.feature)
            .unwrap_or(&empty);

        let encoded = single_bytes(map, KEY_ENCODED)?.unwrap_or_default();
        let text = match single_bytes(map, KEY_TEXT)? {
            Some(raw) => String::from_utf8(raw).map_err(|_| ContractError::InvalidUtf8 {
                key: KEY_TEXT.to_string(),
            })?,
            None => String::new(),
        };
        let label = single_int64(map, KEY_LABEL)?.unwrap_or(MISSING_LABEL);

        let xmin = float_values(map, KEY_BBOX_XMIN)?;
        let ymin = float_values(map, KEY_BBOX_YMIN)?;
        let xmax = float_values(map, KEY_BBOX_XMAX)?;
        let ymax = float_values(map, KEY_BBOX_YMAX)?;
        let n = xmin.len();
        if ymin.len() != n || xmax.len() != n || ymax.len() != n {
            return Err(ContractError::BboxLengthMismatch {
                xmin: xmin.len(),
                ymin: ymin.len(),
                xmax: xmax.len(),
                ymax: ymax.len(),
            });
        }
        let boxes = (0..n)
            .map(|i| BoundingBox::new(xmin[i], ymin[i], xmax[i], ymax[i]))
            .collect();

        Ok(Self {
            encoded,
            label,
            text,
            boxes,
        })
    }

    pub fn to_example(&self) -> Example {
        let mut feature = HashMap::new();
        feature.insert(
            KEY_ENCODED.to_string(),
            Feature::bytes(vec![self.encoded.clone()]),
        );
        feature.insert(KEY_LABEL.to_string(), Feature::int64s(vec![self.label]));
        feature.insert(
            KEY_TEXT.to_string(),
            Feature::bytes(vec![self.text.as_bytes().to_vec()]),
        );
        let column = |f: fn(&BoundingBox) -> f32| self.boxes.iter().map(f).collect::<Vec<_>>();
        feature.insert(KEY_BBOX_XMIN.to_string(), Feature::floats(column(|b| b.xmin)));
        feature.insert(KEY_BBOX_YMIN.to_string(), Feature::floats(column(|b| b.ymin)));
        feature.insert(KEY_BBOX_XMAX.to_string(), Feature::floats(column(|b| b.xmax)));
        feature.insert(KEY_BBOX_YMAX.to_string(), Feature::floats(column(|b| b.ymax)));
        Example {
            features: Some(Features { feature }),
        }
    }
}

fn single_bytes(
    map: &HashMap<String, Feature>,
    key: &str,
) -> Result<Option<Vec<u8>>, ContractError> {
    let Some(feat) = map.get(key) else {
        return Ok(None);
    };
    match &feat.kind {
        Some(feature::Kind::BytesList(list)) => match list.value.len() {
            0 => Ok(None),
            1 => Ok(list.value.first().cloned()),
            len => Err(ContractError::FeatureLength {
                key: key.to_string(),
                len,
            }),
        },
        None => Ok(None),
        Some(_) => Err(ContractError::FeatureKind {
            key: key.to_string(),
            expected: "bytes_list",
            found: feat.kind_name(),
        }),
    }
}

fn single_int64(map: &HashMap<String, Feature>, key: &str) -> Result<Option<i64>, ContractError> {
    let Some(feat) = map.get(key) else {
        return Ok(None);
    };
    match &feat.kind {
        Some(feature::Kind::Int64List(list)) => match list.value.len() {
            0 => Ok(None),
            1 => Ok(list.value.first().copied()),
            len => Err(ContractError::FeatureLength {
                key: key.to_string(),
                len,
            }),
        },
        None => Ok(None),
        Some(_) => Err(ContractError::FeatureKind {
            key: key.to_string(),
            expected: "int64_list",
            found: feat.kind_name(),
        }),
    }
}

fn float_values(map: &HashMap<String, Feature>, key: &str) -> Result<Vec<f32>, ContractError> {
    let Some(feat) = map.get(key) else {
        return Ok(Vec::new());
    };
    match &feat.kind {
        Some(feature::Kind::FloatList(list)) => Ok(list.value.clone()),
        None => Ok(Vec::new()),
        Some(_) => Err(ContractError::FeatureKind {
            key: key.to_string(),
            expected: "float_list",
            found: feat.kind_name(),
        }),
    }
}
