//! Structured cache keys with prefix matching.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// One component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum KeyPart {
  Text(String),
  Int(i64),
  /// Filter parameters, sorted by name with empty values dropped
  Params(BTreeMap<String, String>),
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Text(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Text(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Text(s.clone())
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(i64::from(n))
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Text(s) => write!(f, "{}", s),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Params(params) => {
        write!(f, "{{")?;
        for (i, (k, v)) in params.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
      }
    }
  }
}

/// Ordered, structurally comparable cache key.
///
/// Keys form a hierarchy: `["leads"]` is a prefix of `["leads", "list", {..}, 2]`,
/// so invalidating or removing `["leads"]` reaches every leads entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
  parts: Vec<KeyPart>,
}

impl CacheKey {
  /// Create a key rooted at an entity type.
  pub fn new(root: impl Into<KeyPart>) -> Self {
    Self {
      parts: vec![root.into()],
    }
  }

  /// Append a component.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.parts.push(part.into());
    self
  }

  /// Append normalized filter parameters.
  ///
  /// Whitespace is trimmed and empty values are dropped, so `{status: ""}`
  /// and `{}` name the same entry.
  pub fn with_params<I, K, V>(mut self, params: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<str>,
  {
    let normalized: BTreeMap<String, String> = params
      .into_iter()
      .filter_map(|(k, v)| {
        let v = v.as_ref().trim();
        (!v.is_empty()).then(|| (k.into(), v.to_string()))
      })
      .collect();
    self.parts.push(KeyPart::Params(normalized));
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  /// Entity type this key belongs to.
  pub fn root(&self) -> Option<&str> {
    match self.parts.first() {
      Some(KeyPart::Text(s)) => Some(s),
      _ => None,
    }
  }

  /// True if `prefix` matches the leading components of this key.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.parts.len() >= prefix.parts.len() && self.parts[..prefix.parts.len()] == prefix.parts[..]
  }

  /// Log form of the key with filter parameters replaced by a digest.
  pub fn redacted(&self) -> Redacted<'_> {
    Redacted(self)
  }
}

/// Filter values can carry search text and email addresses, so logs show a
/// stable digest of them instead.
pub struct Redacted<'a>(&'a CacheKey);

fn digest(text: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(text.as_bytes());
  hex::encode(&hasher.finalize()[..8])
}

impl fmt::Display for Redacted<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, part) in self.0.parts.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      match part {
        KeyPart::Params(params) if !params.is_empty() => write!(f, "#{}", digest(&part.to_string()))?,
        part => write!(f, "{}", part)?,
      }
    }
    Ok(())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, part) in self.parts.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      write!(f, "{}", part)?;
    }
    Ok(())
  }
}

impl From<&str> for CacheKey {
  fn from(s: &str) -> Self {
    CacheKey::new(s)
  }
}
