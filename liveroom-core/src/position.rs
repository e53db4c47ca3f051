//! Fractional position keys for list items.
//!
//! A position is a base-94 fraction `0.d₀d₁d₂…` written with the printable
//! ASCII range `!`..=`~`. Byte-wise string order equals numeric order because
//! generated keys never end in the zero digit. A new key can always be made
//! strictly between two existing ones, so inserting never renumbers siblings.
//!
//! Two replicas inserting between the same neighbours produce the same key;
//! the list breaks that tie by item id (see `tree::ListItem`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const BASE: u16 = 94;
const OFFSET: u8 = b'!';

/// Keys received over the wire go through [`Position::parse`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Position(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid position key {0:?}")]
pub struct InvalidPosition(pub String);

impl Position {
    /// Key for the first item of an empty list.
    pub fn first() -> Self {
        Self::between(None, None)
    }

    /// A key strictly after `pos`.
    pub fn after(pos: &Position) -> Self {
        Self::between(Some(pos), None)
    }

    /// A key strictly before `pos`.
    pub fn before(pos: &Position) -> Self {
        Self::between(None, Some(pos))
    }

    /// A key strictly between `lo` and `hi`.
    ///
    /// `None` means the open end of the list. If `hi` is not greater than
    /// `lo` (equal keys from concurrent inserts) it is ignored and the result
    /// lands right after `lo`.
    pub fn between(lo: Option<&Position>, hi: Option<&Position>) -> Self {
        let lo_digits = lo.map(Position::digits).unwrap_or_default();
        let hi_digits = match (lo, hi) {
            (Some(l), Some(h)) if h <= l => None,
            (_, Some(h)) => Some(h.digits()),
            _ => None,
        };

        let mut upper = hi_digits.as_deref();
        let mut out = Vec::with_capacity(lo_digits.len() + 1);
        let mut i = 0;
        loop {
            let l = lo_digits.get(i).copied().unwrap_or(0) as u16;
            let h = match upper {
                Some(digits) => digits.get(i).copied().unwrap_or(0) as u16,
                None => BASE,
            };
            if h > l + 1 {
                out.push(((l + h) / 2) as u8);
                break;
            }
            out.push(l as u8);
            if h == l + 1 {
                // Everything below the next digit of `hi` stays below `hi`.
                upper = None;
            }
            i += 1;
        }
        Self::from_digits(&out)
    }

    /// Parse a key received from elsewhere.
    pub fn parse(s: &str) -> Option<Self> {
        is_key(s).then(|| Self(s.to_string()))
    }

    /// Whether the key could have come out of [`Position::parse`].
    pub fn is_valid(&self) -> bool {
        is_key(&self.0)
    }

    #[cfg(test)]
    pub(crate) fn unchecked(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digits(&self) -> Vec<u8> {
        self.0.bytes().map(|b| b - OFFSET).collect()
    }

    fn from_digits(digits: &[u8]) -> Self {
        Self(digits.iter().map(|d| (d + OFFSET) as char).collect())
    }
}

fn is_key(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (OFFSET..OFFSET + BASE as u8).contains(&b)) && !s.ends_with(OFFSET as char)
}

impl TryFrom<String> for Position {
    type Error = InvalidPosition;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_key(&s) {
            Ok(Self(s))
        } else {
            Err(InvalidPosition(s))
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_is_middle_of_range() {
        let p = Position::first();
        assert_eq!(p.as_str().len(), 1);
        assert!(Position::parse(p.as_str()).is_some());
    }

    #[test]
    fn test_between_neighbours() {
        let a = Position::first();
        let b = Position::after(&a);
        let mid = Position::between(Some(&a), Some(&b));
        assert!(a < mid && mid < b);
    }

    #[test]
    fn test_adjacent_digits_extend_key() {
        let a = Position::parse("a").unwrap();
        let b = Position::parse("b").unwrap();
        let mid = Position::between(Some(&a), Some(&b));
        assert!(a < mid && mid < b);
        assert!(mid.as_str().len() > 1);
    }

    #[test]
    fn test_repeated_prepend_stays_ordered() {
        let mut head = Position::first();
        for _ in 0..200 {
            let next = Position::before(&head);
            assert!(next < head, "{next} should sort before {head}");
            head = next;
        }
    }

    #[test]
    fn test_repeated_append_stays_ordered() {
        let mut tail = Position::first();
        for _ in 0..200 {
            let next = Position::after(&tail);
            assert!(next > tail);
            tail = next;
        }
    }

    #[test]
    fn test_equal_bounds_fall_after_lower() {
        let a = Position::first();
        let p = Position::between(Some(&a), Some(&a));
        assert!(p > a);
    }

    #[test]
    fn test_parse_rejects_trailing_zero_digit() {
        assert!(Position::parse("a!").is_none());
        assert!(Position::parse("").is_none());
        assert!(Position::parse("a b").is_none());
    }

    #[test]
    fn test_deserialize_rejects_malformed_keys() {
        for bad in ["", "a!", "a\u{1}", "\u{7f}"] {
            let json = serde_json::to_string(bad).unwrap();
            assert!(serde_json::from_str::<Position>(&json).is_err(), "{bad:?} should not deserialize");
        }
        let good: Position = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(good, Position::parse("a").unwrap());
        assert!(good.is_valid());
    }

    #[test]
    fn test_deserialize_rejects_malformed_keys_in_bincode() {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(String::new(), config).unwrap();
        let decoded: Result<(Position, usize), _> = bincode::serde::decode_from_slice(&bytes, config);
        assert!(decoded.is_err());
    }

    proptest! {
        #[test]
        fn between_is_strictly_inside(seq in proptest::collection::vec(any::<bool>(), 1..60)) {
            // Build keys by repeatedly inserting on the left or right half of a gap.
            let mut lo = Position::first();
            let mut hi = Position::after(&lo);
            for go_left in seq {
                let mid = Position::between(Some(&lo), Some(&hi));
                prop_assert!(lo < mid && mid < hi);
                prop_assert!(Position::parse(mid.as_str()).is_some());
                if go_left { hi = mid } else { lo = mid }
            }
        }
    }
}
