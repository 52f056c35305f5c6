//! Segment codec: maps a logical name onto one or more length-bounded
//! physical names and back.
//!
//! A logical name is first base64url-encoded. If the encoded form fits in
//! `max_len` it is stored as-is (a *simple* segment). Otherwise it is cut into
//! chunks, each stored under a *split* name of the form
//!
//! ```text
//! .sd.<hash>.<clash_index>.<total_split>.<split_index>.<payload>
//! ```
//!
//! where `hash` is the first 12 base64url characters of a SHAKE128 digest of
//! the encoded name. All numeric fields are decimal.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;
use thiserror::Error;

/// Marker that starts every split segment name.
pub const SPLIT_PREFIX: &str = ".sd";
/// Length of the group hash in characters.
pub const NAME_HASH_LEN: usize = 12;
/// Upper bound on the number of segments a single name may occupy.
pub const MAX_SPLIT_NUM: usize = 0xff;

/// Errors raised when a name cannot be represented under a length bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The name would need more segments than the split index can address.
    #[error("name needs {segments} segments, more than the {max} allowed")]
    TooManySegments {
        /// Segments the name would have needed.
        segments: usize,
        /// Maximum supported segment count.
        max: usize,
    },
    /// The length bound leaves no room for payload after the split overhead.
    #[error("max segment length {max_len} cannot hold split overhead of {overhead} plus payload")]
    SegmentTooShort {
        /// Configured segment length bound.
        max_len: usize,
        /// Fixed overhead of a split name.
        overhead: usize,
    },
}

/// Errors raised when a set of physical names cannot be turned back into a name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No segments were supplied.
    #[error("no segments to decode")]
    Empty,
    /// A simple segment appeared in a multi-segment set.
    #[error("segment {name} is not a split name")]
    MixedFormat {
        /// The offending physical name.
        name: String,
    },
    /// A split name or split group failed validation.
    #[error("malformed split name {name}: {reason}")]
    Malformed {
        /// The offending physical name (or group hash).
        name: String,
        /// What failed.
        reason: String,
    },
    /// Reassembled payload does not hash to the group hash.
    #[error("group hash {expected} does not match reassembled name hash {actual}")]
    HashMismatch {
        /// Hash carried by the segment names.
        expected: String,
        /// Hash of the reassembled payload.
        actual: String,
    },
    /// Payload is not valid base64url.
    #[error("invalid base64 payload: {reason}")]
    InvalidBase64 {
        /// Decoder message.
        reason: String,
    },
    /// Decoded bytes are not UTF-8 (only for string decoding).
    #[error("decoded name is not valid UTF-8")]
    InvalidUtf8,
}

/// Identifies which split segments belong to the same logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// 12-character name hash.
    pub hash: String,
    /// Disambiguator for unrelated names sharing a hash.
    pub clash_index: u32,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.hash, self.clash_index)
    }
}

/// Parsed form of one split segment name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitName {
    pub hash: String,
    pub clash_index: u32,
    pub total_split: usize,
    pub split_index: usize,
    pub payload: String,
}

impl SplitName {
    /// Group this segment belongs to.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            hash: self.hash.clone(),
            clash_index: self.clash_index,
        }
    }
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            SPLIT_PREFIX, self.hash, self.clash_index, self.total_split, self.split_index, self.payload
        )
    }
}

impl FromStr for SplitName {
    type Err = DecodeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| DecodeError::Malformed {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let rest = name
            .strip_prefix(SPLIT_PREFIX)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or_else(|| malformed("missing split prefix"))?;

        let fields: Vec<&str> = rest.split('.').collect();
        if fields.len() != 5 {
            return Err(malformed("expected 5 dot-separated fields"));
        }

        let hash = fields[0];
        if hash.len() != NAME_HASH_LEN || !hash.bytes().all(is_base64url_byte) {
            return Err(malformed("hash is not 12 base64url characters"));
        }

        let clash_index = parse_decimal(fields[1]).ok_or_else(|| malformed("bad clash index"))?;
        let total_split = parse_decimal(fields[2]).ok_or_else(|| malformed("bad total split"))?;
        let split_index = parse_decimal(fields[3]).ok_or_else(|| malformed("bad split index"))?;

        let clash_index = u32::try_from(clash_index).map_err(|_| malformed("clash index overflows"))?;
        let total_split = usize::try_from(total_split).map_err(|_| malformed("total split overflows"))?;
        let split_index = usize::try_from(split_index).map_err(|_| malformed("split index overflows"))?;

        if total_split == 0 || total_split > MAX_SPLIT_NUM {
            return Err(malformed("total split out of range"));
        }
        if split_index >= total_split {
            return Err(malformed("split index not below total split"));
        }

        let payload = fields[4];
        if payload.is_empty() || !payload.bytes().all(is_payload_byte) {
            return Err(malformed("payload is not base64url"));
        }

        Ok(SplitName {
            hash: hash.to_string(),
            clash_index,
            total_split,
            split_index,
            payload: payload.to_string(),
        })
    }
}

fn parse_decimal(field: &str) -> Option<u64> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn is_base64url_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn is_payload_byte(b: u8) -> bool {
    is_base64url_byte(b) || b == b'='
}

/// True when `name` uses the split-segment layout.
pub fn is_split_name(name: &str) -> bool {
    name.strip_prefix(SPLIT_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Name hash: SHAKE128 squeezed to 12 bytes, base64url-encoded, first 12 chars.
pub fn name_hash(encoded_name: &str) -> String {
    let mut hasher = Shake128::default();
    hasher.update(encoded_name.as_bytes());
    let mut reader = hasher.finalize_xof();
    let mut digest = [0u8; NAME_HASH_LEN];
    reader.read(&mut digest);
    let mut hash = URL_SAFE.encode(digest);
    hash.truncate(NAME_HASH_LEN);
    hash
}

/// Fixed length of a split name without its payload.
pub fn split_overhead(clash_index: u32) -> usize {
    SplitName {
        hash: "A".repeat(NAME_HASH_LEN),
        clash_index,
        total_split: MAX_SPLIT_NUM,
        split_index: MAX_SPLIT_NUM,
        payload: String::new(),
    }
    .to_string()
    .len()
}

/// Smallest `max_len` able to hold a split name with one payload character.
pub fn min_segment_len(clash_index: u32) -> usize {
    split_overhead(clash_index) + 1
}

/// Encode `name` into physical segment names of at most `max_len` characters.
///
/// Returns a single simple segment when the base64url form fits, otherwise
/// split segments ordered by split index.
pub fn encode(name: impl AsRef<[u8]>, max_len: usize, clash_index: u32) -> Result<Vec<String>, EncodeError> {
    let encoded = URL_SAFE.encode(name.as_ref());
    if encoded.len() <= max_len {
        return Ok(vec![encoded]);
    }

    let overhead = split_overhead(clash_index);
    if max_len <= overhead {
        return Err(EncodeError::SegmentTooShort { max_len, overhead });
    }
    let capacity = max_len - overhead;

    let segments = encoded.len().div_ceil(capacity);
    if segments > MAX_SPLIT_NUM {
        return Err(EncodeError::TooManySegments {
            segments,
            max: MAX_SPLIT_NUM,
        });
    }

    let hash = name_hash(&encoded);
    // base64url output is ASCII, so byte chunks are char boundaries
    let names = encoded
        .as_bytes()
        .chunks(capacity)
        .enumerate()
        .map(|(split_index, chunk)| {
            SplitName {
                hash: hash.clone(),
                clash_index,
                total_split: segments,
                split_index,
                payload: String::from_utf8_lossy(chunk).into_owned(),
            }
            .to_string()
        })
        .collect();
    Ok(names)
}

/// Decode a set of physical names (in any order) back into the logical name bytes.
pub fn decode<S: AsRef<str>>(segments: &[S]) -> Result<Vec<u8>, DecodeError> {
    match segments {
        [] => Err(DecodeError::Empty),
        [single] if !is_split_name(single.as_ref()) => decode_base64(single.as_ref()),
        _ => {
            let parts = segments
                .iter()
                .map(|s| {
                    let s = s.as_ref();
                    if !is_split_name(s) {
                        return Err(DecodeError::MixedFormat { name: s.to_string() });
                    }
                    s.parse::<SplitName>()
                })
                .collect::<Result<Vec<_>, _>>()?;
            decode_split(parts)
        }
    }
}

/// Decode a set of physical names into a UTF-8 logical name.
pub fn decode_str<S: AsRef<str>>(segments: &[S]) -> Result<String, DecodeError> {
    String::from_utf8(decode(segments)?).map_err(|_| DecodeError::InvalidUtf8)
}

/// Reassemble already-parsed split names of one group.
pub fn decode_split(mut parts: Vec<SplitName>) -> Result<Vec<u8>, DecodeError> {
    let first = parts.first().ok_or(DecodeError::Empty)?;
    let key = first.group_key();
    let total = first.total_split;

    for part in &parts {
        if part.group_key() != key {
            return Err(DecodeError::Malformed {
                name: part.to_string(),
                reason: format!("belongs to group {} not {}", part.group_key(), key),
            });
        }
        if part.total_split != total {
            return Err(DecodeError::Malformed {
                name: part.to_string(),
                reason: format!("total split {} disagrees with {}", part.total_split, total),
            });
        }
    }

    parts.sort_by_key(|p| p.split_index);
    let contiguous = parts.len() == total && parts.iter().enumerate().all(|(i, p)| p.split_index == i);
    if !contiguous {
        return Err(DecodeError::Malformed {
            name: key.to_string(),
            reason: format!("have {} of {} segments or indices are not contiguous", parts.len(), total),
        });
    }

    let encoded: String = parts.iter().map(|p| p.payload.as_str()).collect();
    let actual = name_hash(&encoded);
    if actual != key.hash {
        return Err(DecodeError::HashMismatch {
            expected: key.hash,
            actual,
        });
    }
    decode_base64(&encoded)
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE
        .decode(encoded)
        .map_err(|e| DecodeError::InvalidBase64 { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: &str = "sdfsdfsfeeeeeeeee141 的说法是色纷纷士大夫大师傅瑟夫随风倒十分士大夫额发生的是发士大夫额士大夫大师傅手动";

    #[test]
    fn test_short_name_is_simple() {
        let names = encode("hello.txt", 64, 0).unwrap();
        assert_eq!(names, vec![URL_SAFE.encode("hello.txt")]);
        assert!(!is_split_name(&names[0]));
        assert_eq!(decode_str(&names).unwrap(), "hello.txt");
    }

    #[test]
    fn test_long_name_splits_and_round_trips() {
        let names = encode(LONG, 40, 0).unwrap();
        assert!(names.len() >= 2);
        for (i, n) in names.iter().enumerate() {
            assert!(n.len() <= 40, "{} longer than 40", n);
            let parsed: SplitName = n.parse().unwrap();
            assert_eq!(parsed.split_index, i);
            assert_eq!(parsed.total_split, names.len());
        }
        let mut shuffled = names.clone();
        shuffled.reverse();
        assert_eq!(decode_str(&shuffled).unwrap(), LONG);
    }

    #[test]
    fn test_overhead_is_27_for_clash_zero() {
        assert_eq!(split_overhead(0), 27);
        assert_eq!(min_segment_len(0), 28);
        assert_eq!(split_overhead(1234), 30);
    }

    #[test]
    fn test_segment_too_short() {
        let err = encode("a".repeat(100), 27, 0).unwrap_err();
        assert_eq!(err, EncodeError::SegmentTooShort { max_len: 27, overhead: 27 });
    }

    #[test]
    fn test_too_many_segments() {
        // capacity 1 char per segment, encoded length 268
        let err = encode(vec![7u8; 200], 28, 0).unwrap_err();
        assert!(matches!(err, EncodeError::TooManySegments { segments: 268, max: 255 }));
    }

    #[test]
    fn test_disagreeing_total_split_is_malformed() {
        let part = |total_split, split_index| SplitName {
            hash: "AAAAAAAAAAAA".to_string(),
            clash_index: 0,
            total_split,
            split_index,
            payload: "aGVsbG8".to_string(),
        };
        let err = decode_split(vec![part(2, 0), part(3, 1)]).unwrap_err();
        match err {
            DecodeError::Malformed { reason, .. } => assert!(reason.contains("total split"), "{}", reason),
            other => panic!("unexpected error: {:?}", other),
        }

        let names = vec![part(2, 0).to_string(), part(3, 1).to_string()];
        assert!(matches!(decode(&names), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_exactly_255_segments_is_allowed() {
        // capacity 4: 765 bytes -> 1020 chars -> 255 segments, 768 bytes -> 256
        let name = vec![1u8; 765];
        let names = encode(&name, 31, 0).unwrap();
        assert_eq!(names.len(), 255);
        assert_eq!(decode(&names).unwrap(), name);

        let err = encode(vec![1u8; 768], 31, 0).unwrap_err();
        assert_eq!(err, EncodeError::TooManySegments { segments: 256, max: 255 });
    }

    #[test]
    fn test_name_hash_shape() {
        let h = name_hash("abc");
        assert_eq!(h.len(), NAME_HASH_LEN);
        assert!(h.bytes().all(is_base64url_byte));
        assert_eq!(h, name_hash("abc"));
        assert_ne!(h, name_hash("abd"));
    }

    #[test]
    fn test_split_name_display_parse() {
        let sn = SplitName {
            hash: "abcdefghijkl".to_string(),
            clash_index: 2,
            total_split: 12,
            split_index: 11,
            payload: "QUJD".to_string(),
        };
        let text = sn.to_string();
        assert_eq!(text, ".sd.abcdefghijkl.2.12.11.QUJD");
        assert_eq!(text.parse::<SplitName>().unwrap(), sn);
    }

    #[test]
    fn test_parse_rejects_bad_fields() {
        for bad in [
            ".sd.abcdefghijkl.0.2.0",
            ".sd.abc.0.2.0.QQ",
            ".sd.abcdefghijkl.x.2.0.QQ",
            ".sd.abcdefghijkl.0.+2.0.QQ",
            ".sd.abcdefghijkl.0.2.2.QQ",
            ".sd.abcdefghijkl.0.0.0.QQ",
            ".sd.abcdefghijkl.0.256.0.QQ",
            ".sd.abcdefghijkl.0.2.0.",
            ".sd.abcdefghijkl.0.2.0.Q.Q",
            ".sd.abcdefghij!l.0.2.0.QQ",
        ] {
            assert!(
                matches!(bad.parse::<SplitName>(), Err(DecodeError::Malformed { .. })),
                "{} should be malformed",
                bad
            );
        }
    }

    #[test]
    fn test_is_split_name() {
        assert!(is_split_name(".sd.x"));
        assert!(!is_split_name(".sdx"));
        assert!(!is_split_name("aGVsbG8="));
    }

    #[test]
    fn test_decode_empty() {
        let none: [&str; 0] = [];
        assert_eq!(decode(&none), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_mixed_format() {
        let mut names = encode(LONG, 40, 0).unwrap();
        names.push(URL_SAFE.encode("plain"));
        assert!(matches!(decode(&names), Err(DecodeError::MixedFormat { .. })));
    }

    #[test]
    fn test_decode_missing_middle_segment() {
        let mut names = encode(LONG, 40, 0).unwrap();
        assert!(names.len() >= 3);
        names.remove(1);
        assert!(matches!(decode(&names), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_decode_duplicate_segment() {
        let mut names = encode(LONG, 40, 0).unwrap();
        let dup = names[0].clone();
        names.pop();
        names.push(dup);
        assert!(matches!(decode(&names), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_decode_detects_foreign_group_member() {
        let a = encode(LONG, 40, 0).unwrap();
        let b = encode(format!("{}-other", LONG), 40, 0).unwrap();
        let mixed = vec![a[0].clone(), b[1].clone()];
        assert!(matches!(decode(&mixed), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_decode_detects_hash_mismatch() {
        let names = encode(LONG, 40, 0).unwrap();
        let mut parts: Vec<SplitName> = names.iter().map(|n| n.parse().unwrap()).collect();
        parts[0].payload = parts[0].payload.chars().rev().collect();
        assert!(matches!(decode_split(parts), Err(DecodeError::HashMismatch { .. })));
    }

    #[test]
    fn test_clash_index_carried_in_names() {
        let names = encode(LONG, 40, 3).unwrap();
        for n in &names {
            let parsed: SplitName = n.parse().unwrap();
            assert_eq!(parsed.clash_index, 3);
            assert!(n.len() <= 40);
        }
        assert_eq!(decode_str(&names).unwrap(), LONG);
    }

    #[test]
    fn test_empty_name_round_trips() {
        let names = encode("", 64, 0).unwrap();
        assert_eq!(names, vec![String::new()]);
        assert_eq!(decode(&names).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_invalid_simple_segment() {
        assert!(matches!(decode(&["not base64!"]), Err(DecodeError::InvalidBase64 { .. })));
    }
}
