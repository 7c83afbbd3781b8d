//! Domain search patterns shared by every store backend.

use crate::error::StoreError;
use regex::Regex;

/// An unanchored, ASCII case-insensitive domain pattern where `*` matches any
/// run of characters. Non-ASCII letters only match themselves, the way
/// SQLite's `LIKE` compares them.
///
/// `example` matches `www.example.com`; `shop*.com` matches `shop.evil.com`.
/// A literal `*` in a stored wildcard domain is matched by `*` as well.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    raw: String,
    regex: Regex,
}

impl DomainPattern {
    pub fn new(pattern: &str) -> Result<Self, StoreError> {
        let body = pattern
            .split('*')
            .map(ascii_case_insensitive)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?s){body}"))
            .map_err(|e| StoreError::Serialization(format!("invalid search pattern: {e}")))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_match(&self, domain: &str) -> bool {
        self.regex.is_match(domain)
    }

    /// Translates the pattern into a SQL `LIKE` operand for use with
    /// `ESCAPE '\'`.
    pub fn to_like(&self) -> String {
        let mut like = String::with_capacity(self.raw.len() + 2);
        like.push('%');
        for c in self.raw.chars() {
            match c {
                '*' => like.push('%'),
                '%' | '_' | '\\' => {
                    like.push('\\');
                    like.push(c);
                }
                _ => like.push(c),
            }
        }
        like.push('%');
        like
    }
}

/// Escapes `literal`, turning each ASCII letter into a two-case class.
fn ascii_case_insensitive(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len() * 2);
    for c in literal.chars() {
        if c.is_ascii_alphabetic() {
            out.push('[');
            out.push(c.to_ascii_lowercase());
            out.push(c.to_ascii_uppercase());
            out.push(']');
        } else {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
        }
    }
    out
}
