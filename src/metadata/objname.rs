//! Backward-compatible object naming.
//!
//! The replicated metadata map predates multi-database support, so the
//! external namespace stays two-level (`type → id`) and the database number
//! rides inside the id as a pseudo hash tag:
//!
//! - 1.0 form: `name` — database 0, no hash tag anywhere.
//! - 1.1 form: `{dddd}name` — `dddd` is the ASCII database number. Non-digit
//!   characters between the digits and the closing brace are reserved for
//!   future expansion and ignored on decode.
//!
//! Encoding emits the raw name only when the database is 0 *and* the name
//! itself carries no hash tag; everything else uses the 1.1 form so a 1.0
//! peer never misparses it.

use std::fmt;

/// `(db_num, name)` pair with its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjName {
    db_num: u32,
    name: String,
}

impl ObjName {
    pub fn new(db_num: u32, name: impl Into<String>) -> Self {
        Self {
            db_num,
            name: name.into(),
        }
    }

    pub fn db_num(&self) -> u32 {
        self.db_num
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode(&self) -> String {
        if self.db_num == 0 && !self.name.contains('{') {
            return self.name.clone();
        }
        format!("{{{}}}{}", self.db_num, self.name)
    }

    pub fn decode(encoded: &str) -> Self {
        let bytes = encoded.as_bytes();
        if bytes.first() == Some(&b'{') {
            if let Some(close) = encoded.find('}') {
                let tag = &encoded[1..close];
                let digits: String = tag.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() {
                    if digits.len() != tag.len() {
                        tracing::debug!(encoded, "ignoring extended object name metadata");
                    }
                    if let Ok(db_num) = digits.parse::<u32>() {
                        return Self {
                            db_num,
                            name: encoded[close + 1..].to_string(),
                        };
                    }
                }
                tracing::warn!(encoded, "invalid encoded object name; assuming 1.0 form");
            }
        }
        Self {
            db_num: 0,
            name: encoded.to_string(),
        }
    }
}

impl fmt::Display for ObjName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.db_num, self.name)
    }
}
