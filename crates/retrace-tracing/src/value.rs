// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribute values and their on-wire payload encoding.
//!
//! Primitive values are encoded as native little-endian fixed-width
//! bytes, strings as raw UTF-8, and homogeneous sequences as the
//! concatenation of their elements. A sequence of strings is the one
//! exception: it expands into one `AttributeValue` record per element,
//! all sharing the same key. The decoder recovers primitive widths from
//! the record size field.

/// A span attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
    BoolSeq(Vec<bool>),
    I32Seq(Vec<i32>),
    I64Seq(Vec<i64>),
    U32Seq(Vec<u32>),
    U64Seq(Vec<u64>),
    F64Seq(Vec<f64>),
    StrSeq(Vec<String>),
}

impl Value {
    /// The payloads to emit, one `AttributeValue` record each. Every
    /// variant yields exactly one payload except `StrSeq`, which yields
    /// one per element.
    pub fn record_payloads(&self) -> Vec<Vec<u8>> {
        match self {
            Value::Bool(v) => vec![vec![u8::from(*v)]],
            Value::I32(v) => vec![v.to_le_bytes().to_vec()],
            Value::I64(v) => vec![v.to_le_bytes().to_vec()],
            Value::U32(v) => vec![v.to_le_bytes().to_vec()],
            Value::U64(v) => vec![v.to_le_bytes().to_vec()],
            Value::F64(v) => vec![v.to_le_bytes().to_vec()],
            Value::Str(s) => vec![s.as_bytes().to_vec()],
            Value::BoolSeq(vs) => vec![vs.iter().map(|v| u8::from(*v)).collect()],
            Value::I32Seq(vs) => vec![concat_le(vs.iter().map(|v| v.to_le_bytes()))],
            Value::I64Seq(vs) => vec![concat_le(vs.iter().map(|v| v.to_le_bytes()))],
            Value::U32Seq(vs) => vec![concat_le(vs.iter().map(|v| v.to_le_bytes()))],
            Value::U64Seq(vs) => vec![concat_le(vs.iter().map(|v| v.to_le_bytes()))],
            Value::F64Seq(vs) => vec![concat_le(vs.iter().map(|v| v.to_le_bytes()))],
            Value::StrSeq(vs) => vs.iter().map(|s| s.as_bytes().to_vec()).collect(),
        }
    }

    /// Integer view used by the trigger interception: only plain integer
    /// variants participate.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            Value::U32(v) => Some(i64::from(*v)),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn concat_le<const N: usize>(chunks: impl Iterator<Item = [u8; N]>) -> Vec<u8> {
    let mut out = Vec::new();
    for c in chunks {
        out.extend_from_slice(&c);
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
