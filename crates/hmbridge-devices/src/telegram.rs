//! Hardware telegram codec.
//!
//! A telegram is ASCII `key=value` pairs separated by commas:
//!
//! ```text
//! p1=1,p2=0,w1=120,w2=96,pe=85,vv=224,...
//! ```
//!
//! Decoding is order-insensitive. Encoding keeps insertion order because the
//! firmware expects each command's keys in a fixed sequence.

use std::fmt;

/// A decoded or outgoing telegram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telegram {
    fields: Vec<(String, String)>,
}

impl Telegram {
    /// Parse a raw telegram.
    ///
    /// Fragments without `=` or with an empty key are ignored.
    pub fn parse(raw: &str) -> Self {
        let fields = raw
            .trim()
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { fields }
    }

    /// Start an outgoing command telegram: `cd=<code>`.
    pub fn command(code: u32) -> Self {
        Self::default().with("cd", code)
    }

    /// Append a field.
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    /// Append a field in place.
    pub fn push(&mut self, key: &str, value: impl fmt::Display) {
        self.fields.push((key.to_string(), value.to_string()));
    }

    /// Look up a value. When a key repeats, the last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Command code (`cd=`), if present and numeric.
    pub fn code(&self) -> Option<u32> {
        self.get("cd").and_then(|v| v.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
