use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

const F58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Identifier of a Flux job.
///
/// Displayed in decimal. Parsing also accepts the `f58` encoding used by Flux tools
/// (`f` or `ƒ` followed by base58 digits).
#[derive(Copy, Clone, Default, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn to_f58(&self) -> String {
        let mut value = self.0;
        let mut digits = Vec::new();
        loop {
            digits.push(F58_ALPHABET[(value % 58) as usize]);
            value /= 58;
            if value == 0 {
                break;
            }
        }
        let mut output = String::with_capacity(digits.len() + 1);
        output.push('f');
        output.extend(digits.iter().rev().map(|&c| c as char));
        output
    }

    fn parse_f58(digits: &str) -> Option<Self> {
        if digits.is_empty() {
            return None;
        }
        let mut value: u64 = 0;
        for c in digits.bytes() {
            let digit = F58_ALPHABET.iter().position(|&a| a == c)?;
            value = value.checked_mul(58)?.checked_add(digit as u64)?;
        }
        Some(Self(value))
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(digits) = s.strip_prefix('f').or_else(|| s.strip_prefix('ƒ')) {
            Self::parse_f58(digits)
        } else {
            s.parse::<u64>().ok().map(Self)
        };
        parsed.ok_or_else(|| format!("Invalid job id '{s}'"))
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(value) => Ok(JobId(value)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
