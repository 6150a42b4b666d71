use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::models::ids::{TicketCode, CODE_SUFFIX_LEN};

/// Mints candidate ticket codes. Uniqueness is still enforced by the store.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, now: DateTime<Utc>) -> TicketCode;
}

/// `PREFIX-<base36 unix millis>-<4 random bytes as upper hex>`.
#[derive(Debug, Clone)]
pub struct RandomCodeGenerator {
    prefix: String,
}

impl RandomCodeGenerator {
    /// `None` unless the prefix passes [`is_valid_prefix`].
    pub fn new(prefix: impl Into<String>) -> Option<Self> {
        let prefix = prefix.into();
        is_valid_prefix(&prefix).then_some(Self { prefix })
    }
}

impl Default for RandomCodeGenerator {
    fn default() -> Self {
        Self {
            prefix: "CP".to_string(),
        }
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, now: DateTime<Utc>) -> TicketCode {
        let mut suffix = [0u8; CODE_SUFFIX_LEN / 2];
        OsRng.fill_bytes(&mut suffix);

        let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        TicketCode::from_generated(format!(
            "{}-{}-{}",
            self.prefix,
            to_base36(millis),
            hex::encode_upper(suffix)
        ))
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Accepted prefixes: 1-8 characters of `A-Z0-9`.
pub fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= 8
        && prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_generated_codes_have_expected_shape() {
        let generator = RandomCodeGenerator::new("CP").unwrap();
        let code = generator.generate(Utc::now());
        assert!(TicketCode::parse(code.as_str()).is_ok());
        let parts: Vec<&str> = code.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "CP");
        assert_eq!(parts[2].len(), CODE_SUFFIX_LEN);
    }

    #[test]
    fn test_codes_in_the_same_millisecond_differ() {
        let generator = RandomCodeGenerator::default();
        let now = Utc::now();
        let codes: HashSet<_> = (0..200).map(|_| generator.generate(now)).collect();
        assert!(codes.len() > 195);
    }

    #[test]
    fn test_prefix_validation() {
        assert!(is_valid_prefix("CP"));
        assert!(is_valid_prefix("EVT2024"));
        assert!(!is_valid_prefix(""));
        assert!(!is_valid_prefix("cp"));
        assert!(!is_valid_prefix("C-P"));
        assert!(RandomCodeGenerator::new("bad prefix").is_none());
    }
}
