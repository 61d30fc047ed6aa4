use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{crypto::CryptoBox, message::Triple, DUMMY, FIELD_SEP, MARKER_PREFIX};

static BUCKET_SALT: Lazy<Regex> = Lazy::new(|| Regex::new(r"%%\d+$").expect("static regex"));

/// Pattern of the twin salt `-<digits>[_<digits>]` with at least `min_digits` digits.
pub fn twin_salt_pattern(min_salt_length: usize) -> Result<Regex, regex::Error> {
    let digits = min_salt_length.saturating_sub(1).max(1);
    Regex::new(&format!(r"-\d{{{},}}(?:_\d+)?$", digits))
}

/// One side of a join row once decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Side {
    pub tid: String,
    pub join_value: String,
    pub attr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerifiedRow {
    pub join_value: String,
    pub left: Side,
    pub right: Side,
}

impl Side {
    fn byte_size(&self) -> usize {
        self.tid.len() + self.join_value.len() + self.attr.as_ref().map_or(0, String::len)
    }
}

impl VerifiedRow {
    /// Plaintext bytes the row occupies in the result.
    pub fn byte_size(&self) -> usize {
        self.join_value.len() + self.left.byte_size() + self.right.byte_size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanRow {
    pub row: VerifiedRow,
    pub occurrences: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRow {
    Marker(Triple),
    // plaintext size
    Dummy(usize),
    Real(CleanRow),
}

/// How salts and payloads look for the current run.
pub struct RowDecoder<'a> {
    pub crypto: &'a CryptoBox,
    pub twin_pattern: Option<&'a Regex>,
    pub bucket_salts: bool,
    pub is_semi_join: bool,
    pub use_occurrences: bool,
}

impl<'a> RowDecoder<'a> {
    /// Decrypts and un-salts one output row. Any error means the row was
    /// altered after encryption.
    pub fn decode(&self, row: &Triple) -> Result<DecodedRow, String> {
        let key = self.decrypt(&row.0, "key")?;
        let left = self.decrypt(&row.1, "left payload")?;
        let right = self.decrypt(&row.2, "right payload")?;

        if key.starts_with(MARKER_PREFIX) {
            return Ok(DecodedRow::Marker((key, left, right)));
        }
        if is_dummy(&left) || is_dummy(&right) {
            return Ok(DecodedRow::Dummy(key.len() + left.len() + right.len()));
        }

        let (left, left_occ) = self.parse_payload(&left)?;
        let (right, right_occ) = self.parse_payload(&right)?;
        // an unsalted key may itself look salted
        let logical = if left.join_value == key {
            key.as_str()
        } else {
            self.unsalt(&key)
        };
        if left.join_value != logical || right.join_value != logical {
            return Err(format!(
                "join value mismatch: key {} joins {} with {}",
                logical, left.join_value, right.join_value
            ));
        }
        let occurrences = match (left_occ, right_occ) {
            (Some(l), Some(r)) => Some((l, r)),
            _ => None,
        };
        Ok(DecodedRow::Real(CleanRow {
            row: VerifiedRow {
                join_value: logical.to_string(),
                left,
                right,
            },
            occurrences,
        }))
    }

    fn decrypt(&self, cipher_text: &str, what: &str) -> Result<String, String> {
        self.crypto
            .decrypt(cipher_text)
            .map_err(|e| format!("cannot decrypt {}: {}", what, e))
    }

    fn unsalt<'k>(&self, key: &'k str) -> &'k str {
        let mut end = key.len();
        if self.bucket_salts {
            if let Some(m) = BUCKET_SALT.find(key) {
                end = m.start();
            }
        }
        if let Some(pattern) = self.twin_pattern {
            if let Some(m) = pattern.find(&key[..end]) {
                end = m.start();
            }
        }
        &key[..end]
    }

    fn parse_payload(&self, payload: &str) -> Result<(Side, Option<usize>), String> {
        let fields: Vec<&str> = payload.split(FIELD_SEP).collect();
        let expected = 2 + usize::from(!self.is_semi_join) + usize::from(self.use_occurrences);
        if fields.len() != expected {
            return Err(format!("ill-formed payload with {} fields", fields.len()));
        }
        let occurrence = if self.use_occurrences {
            let raw = fields[expected - 1];
            Some(
                raw.parse::<usize>()
                    .map_err(|_| format!("ill-formed occurrence tag {}", raw))?,
            )
        } else {
            None
        };
        let attr = if self.is_semi_join {
            None
        } else {
            Some(fields[2].to_string())
        };
        Ok((
            Side {
                tid: fields[0].to_string(),
                join_value: fields[1].to_string(),
                attr,
            },
            occurrence,
        ))
    }
}

fn is_dummy(payload: &str) -> bool {
    payload.split(FIELD_SEP).next() == Some(DUMMY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::KeyMaterial, utils::get_fixed_rng};

    fn enc(crypto: &CryptoBox, k: &str, l: &str, r: &str) -> Triple {
        (crypto.encrypt(k), crypto.encrypt(l), crypto.encrypt(r))
    }

    #[test]
    fn test_twin_salt_pattern() {
        let p = twin_salt_pattern(3).unwrap();
        assert!(p.is_match("Jerrie-01"));
        assert!(p.is_match("Jerrie-01_3"));
        assert!(!p.is_match("Jerrie-1"));
        assert!(!p.is_match("Jerrie"));
        let p = twin_salt_pattern(0).unwrap();
        assert!(p.is_match("a-7"));
    }

    #[test]
    fn test_decode_real_and_control_rows() {
        let crypto = CryptoBox::new(KeyMaterial::generate(&mut get_fixed_rng()));
        let pattern = twin_salt_pattern(3).unwrap();
        let decoder = RowDecoder {
            crypto: &crypto,
            twin_pattern: Some(&pattern),
            bucket_salts: false,
            is_semi_join: false,
            use_occurrences: false,
        };
        let row = decoder
            .decode(&enc(&crypto, "Ilsa-02_1", "1-L|Ilsa|23", "4-R|Ilsa|x"))
            .unwrap();
        let DecodedRow::Real(clean) = row else {
            panic!("expected a real row");
        };
        assert_eq!(clean.row.join_value, "Ilsa");
        assert_eq!(clean.row.left.tid, "1-L");
        assert_eq!(clean.row.right.attr.as_deref(), Some("x"));
        assert_eq!(clean.occurrences, None);

        let marker = decoder
            .decode(&enc(&crypto, "marker_3", "-3_m|marker_3", "-3_m|marker_3"))
            .unwrap();
        assert!(matches!(marker, DecodedRow::Marker(_)));

        // a join value that only looks salted is kept as is
        let DecodedRow::Real(plain) = decoder
            .decode(&enc(&crypto, "x-12", "1-L|x-12|1", "2-R|x-12|2"))
            .unwrap()
        else {
            panic!("expected a real row");
        };
        assert_eq!(plain.row.join_value, "x-12");

        let dummy = decoder
            .decode(&enc(&crypto, "Ilsa", "dummy|Ilsa|dummy", "4-R|Ilsa|x"))
            .unwrap();
        assert_eq!(dummy, DecodedRow::Dummy("Ilsa".len() + "dummy|Ilsa|dummy".len() + "4-R|Ilsa|x".len()));
    }

    #[test]
    fn test_decode_occurrence_rows() {
        let crypto = CryptoBox::new(KeyMaterial::generate(&mut get_fixed_rng()));
        let decoder = RowDecoder {
            crypto: &crypto,
            twin_pattern: None,
            bucket_salts: true,
            is_semi_join: true,
            use_occurrences: true,
        };
        let DecodedRow::Real(clean) = decoder
            .decode(&enc(&crypto, "Merry%%4", "2-L|Merry|3", "7-R|Merry|1"))
            .unwrap()
        else {
            panic!("expected a real row");
        };
        assert_eq!(clean.row.join_value, "Merry");
        assert_eq!(clean.occurrences, Some((3, 1)));
        assert_eq!(clean.row.left.attr, None);

        assert!(decoder
            .decode(&enc(&crypto, "Merry", "2-L|Merry|three", "7-R|Merry|1"))
            .is_err());
        assert!(decoder
            .decode(&enc(&crypto, "Merry", "2-L|Merry|3", "7-R|Ulla|1"))
            .is_err());
    }

    #[test]
    fn test_decode_tampered_cipher_text() {
        let crypto = CryptoBox::new(KeyMaterial::generate(&mut get_fixed_rng()));
        let decoder = RowDecoder {
            crypto: &crypto,
            twin_pattern: None,
            bucket_salts: false,
            is_semi_join: false,
            use_occurrences: false,
        };
        let (k, l, r) = enc(&crypto, "a", "1-L|a|1", "1-R|a|2");
        let err = decoder.decode(&(k, l + "-1937", r)).unwrap_err();
        assert!(err.contains("left payload"));
    }
}
