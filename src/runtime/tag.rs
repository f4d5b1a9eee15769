//! Stream tags and message payloads

use std::collections::BTreeMap;
use std::fmt;

/// Loosely typed value carried by tags and asynchronous messages
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TagValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
    List(Vec<TagValue>),
    Dict(BTreeMap<String, TagValue>),
}

impl TagValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TagValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TagValue::Null => write!(f, "null"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Str(s) => write!(f, "\"{s}\""),
            TagValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
            TagValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            TagValue::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Str(v)
    }
}

/// Metadata attached to one absolute item offset of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub offset: u64,
    pub key: String,
    pub value: TagValue,
    /// Alias of the block that created the tag
    pub srcid: Option<String>,
}

impl Tag {
    pub fn new(offset: u64, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            offset,
            key: key.into(),
            value: value.into(),
            srcid: None,
        }
    }

    pub fn with_srcid(mut self, srcid: impl Into<String>) -> Self {
        self.srcid = Some(srcid.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut dict = BTreeMap::new();
        dict.insert("freq".to_string(), TagValue::Float(1.5));
        let value = TagValue::List(vec![TagValue::Int(3), TagValue::from("x"), TagValue::Dict(dict)]);
        assert_eq!(value.to_string(), "[3, \"x\", {freq: 1.5}]");
    }

    #[test]
    fn test_tag_builder() {
        let tag = Tag::new(42, "burst", true).with_srcid("src0");
        assert_eq!(tag.offset, 42);
        assert_eq!(tag.value, TagValue::Bool(true));
        assert_eq!(tag.srcid.as_deref(), Some("src0"));
    }
}
