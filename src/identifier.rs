//! CNPJ check-digit validation and generation.
//!
//! A CNPJ is 12 base digits (8-digit root, 4-digit branch) followed by two
//! modulus-11 check digits. The first check digit weighs the 12 base digits,
//! the second weighs the base plus the first check digit.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdentifierError;

const FIRST_WEIGHTS: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const SECOND_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

/// Branch number used for head offices.
pub const HEAD_OFFICE_BRANCH: u32 = 1;

/// A checksum-valid business identifier. Construction always goes through
/// [`validate`] or [`generate`], so holding one means the digits are sound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateIdentifier([u8; 14]);

impl CandidateIdentifier {
    pub fn digits(&self) -> String {
        self.0.iter().map(|d| char::from(b'0' + d)).collect()
    }

    /// `NN.NNN.NNN/NNNN-NN`
    pub fn formatted(&self) -> String {
        let s = self.digits();
        format!(
            "{}.{}.{}/{}-{}",
            &s[0..2],
            &s[2..5],
            &s[5..8],
            &s[8..12],
            &s[12..14]
        )
    }

    pub fn root(&self) -> u32 {
        fold_digits(&self.0[0..8])
    }

    pub fn branch(&self) -> u32 {
        fold_digits(&self.0[8..12])
    }

    pub fn is_head_office(&self) -> bool {
        self.branch() == HEAD_OFFICE_BRANCH
    }
}

impl fmt::Display for CandidateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digits())
    }
}

impl fmt::Debug for CandidateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CandidateIdentifier({})", self.formatted())
    }
}

impl FromStr for CandidateIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate(s)
    }
}

impl Serialize for CandidateIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.digits())
    }
}

impl<'de> Deserialize<'de> for CandidateIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        validate(&raw).map_err(serde::de::Error::custom)
    }
}

fn fold_digits(digits: &[u8]) -> u32 {
    digits.iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d))
}

fn check_digit(digits: &[u8], weights: &[u32]) -> u8 {
    let sum: u32 = digits
        .iter()
        .zip(weights)
        .map(|(d, w)| u32::from(*d) * w)
        .sum();
    let rem = sum % 11;
    if rem < 2 {
        0
    } else {
        (11 - rem) as u8
    }
}

/// Computes both check digits for a 12-digit base.
pub fn check_digits(base: &[u8; 12]) -> [u8; 2] {
    let first = check_digit(base, &FIRST_WEIGHTS);
    let mut extended = [0u8; 13];
    extended[..12].copy_from_slice(base);
    extended[12] = first;
    let second = check_digit(&extended, &SECOND_WEIGHTS);
    [first, second]
}

/// Strips the usual punctuation and parses the remaining digits.
fn parse_digits(raw: &str) -> Result<Vec<u8>, IdentifierError> {
    let mut out = Vec::with_capacity(14);
    for ch in raw.trim().chars() {
        match ch {
            '0'..='9' => out.push(ch as u8 - b'0'),
            '.' | '/' | '-' | ' ' => {}
            other => return Err(IdentifierError::NonDigit { ch: other }),
        }
    }
    Ok(out)
}

/// Validates an externally supplied identifier.
pub fn validate(raw: &str) -> Result<CandidateIdentifier, IdentifierError> {
    let digits = parse_digits(raw)?;
    if digits.len() != 14 {
        return Err(IdentifierError::Length {
            found: digits.len(),
        });
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return Err(IdentifierError::RepeatedDigits);
    }

    let mut base = [0u8; 12];
    base.copy_from_slice(&digits[..12]);
    let expected = check_digits(&base);
    if digits[12..] != expected {
        return Err(IdentifierError::ChecksumMismatch {
            expected: format!("{}{}", expected[0], expected[1]),
            found: format!("{}{}", digits[12], digits[13]),
        });
    }

    let mut all = [0u8; 14];
    all.copy_from_slice(&digits);
    Ok(CandidateIdentifier(all))
}

/// Mints a structurally valid identifier from an 8-digit root and a 4-digit branch.
pub fn generate(root: u32, branch: u32) -> Result<CandidateIdentifier, IdentifierError> {
    if root > 99_999_999 {
        return Err(IdentifierError::RootOutOfRange(root));
    }
    if branch > 9_999 || branch == 0 {
        return Err(IdentifierError::BranchOutOfRange(branch));
    }
    let text = format!("{root:08}{branch:04}");
    let mut base = [0u8; 12];
    for (slot, b) in base.iter_mut().zip(text.bytes()) {
        *slot = b - b'0';
    }
    let [first, second] = check_digits(&base);
    let mut all = [0u8; 14];
    all[..12].copy_from_slice(&base);
    all[12] = first;
    all[13] = second;
    if all.iter().all(|d| *d == all[0]) {
        return Err(IdentifierError::RepeatedDigits);
    }
    Ok(CandidateIdentifier(all))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: [&str; 3] = ["11222333000181", "00000000000191", "33000167000101"];

    #[test]
    fn accepts_known_identifiers() {
        for raw in VALID {
            let id = validate(raw).unwrap();
            assert_eq!(id.digits(), raw);
        }
        assert!(validate("11.222.333/0001-81").is_ok());
    }

    #[test]
    fn rejects_any_trailing_digit_mutation() {
        for raw in VALID {
            let bytes = raw.as_bytes();
            for pos in [12usize, 13] {
                for d in b'0'..=b'9' {
                    if d == bytes[pos] {
                        continue;
                    }
                    let mut mutated = bytes.to_vec();
                    mutated[pos] = d;
                    let mutated = String::from_utf8(mutated).unwrap();
                    assert!(
                        matches!(
                            validate(&mutated),
                            Err(IdentifierError::ChecksumMismatch { .. })
                        ),
                        "{mutated} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            validate("1122233300018"),
            Err(IdentifierError::Length { found: 13 })
        );
        assert_eq!(
            validate("11222333000l81"),
            Err(IdentifierError::NonDigit { ch: 'l' })
        );
        assert_eq!(
            validate("00000000000000"),
            Err(IdentifierError::RepeatedDigits)
        );
    }

    #[test]
    fn generation_matches_validation() {
        let id = generate(11_222_333, HEAD_OFFICE_BRANCH).unwrap();
        assert_eq!(id.digits(), "11222333000181");
        assert_eq!(id.formatted(), "11.222.333/0001-81");
        assert_eq!(id.root(), 11_222_333);
        assert!(id.is_head_office());

        for root in [1u32, 47_960_950, 99_999_999] {
            let id = generate(root, 2).unwrap();
            assert_eq!(validate(&id.digits()).unwrap(), id);
        }
        assert!(generate(100_000_000, 1).is_err());
        assert!(generate(1, 0).is_err());
    }

    #[test]
    fn serde_uses_plain_digits() {
        let id = validate("33000167000101").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"33000167000101\"");
        let back: CandidateIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<CandidateIdentifier>("\"33000167000102\"").is_err());
    }
}
