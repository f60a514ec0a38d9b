//! `tf.train.Example` messages, declared by hand with `prost` derives.
//!
//! Field numbers follow `tensorflow/core/example/{example,feature}.proto` so
//! shards written by other tools decode unchanged.

use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Example {
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Features {
    #[prost(map = "string, message", tag = "1")]
    pub feature: HashMap<String, Feature>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Feature {
    #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
    pub kind: Option<feature::Kind>,
}

pub mod feature {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        BytesList(super::BytesList),
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
        #[prost(message, tag = "3")]
        Int64List(super::Int64List),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

impl Feature {
    pub fn bytes(values: Vec<Vec<u8>>) -> Self {
        Feature {
            kind: Some(feature::Kind::BytesList(BytesList { value: values })),
        }
    }

    pub fn floats(values: Vec<f32>) -> Self {
        Feature {
            kind: Some(feature::Kind::FloatList(FloatList { value: values })),
        }
    }

    pub fn int64s(values: Vec<i64>) -> Self {
        Feature {
            kind: Some(feature::Kind::Int64List(Int64List { value: values })),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match &self.kind {
            Some(feature::Kind::BytesList(_)) => "bytes_list",
            Some(feature::Kind::FloatList(_)) => "float_list",
            Some(feature::Kind::Int64List(_)) => "int64_list",
            None => "empty",
        }
    }
}
