use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::WalletError;

/// BIP44-style path `purpose'/coin_type'/account'/change/index`
///
/// Ordering puts the change chain first and the address index second, so a
/// sorted list walks the receive chain before the change chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DerivationPath {
    pub purpose: u32,
    pub coin_type: u32,
    pub account: u32,
    pub change: u32,
    pub index: u32,
}

impl DerivationPath {
    pub fn new(
        purpose: u32,
        coin_type: u32,
        account: u32,
        change: u32,
        index: u32,
    ) -> Result<Self, WalletError> {
        if change > 1 {
            return Err(WalletError::invalid(format!(
                "Change must be 0 or 1, got {}",
                change
            )));
        }
        Ok(Self {
            purpose,
            coin_type,
            account,
            change,
            index,
        })
    }

    /// Same chain, different index
    pub fn with_index(&self, index: u32) -> Self {
        Self { index, ..*self }
    }

    pub fn is_change(&self) -> bool {
        self.change == 1
    }
}

impl Ord for DerivationPath {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.change, self.index, self.purpose, self.coin_type, self.account).cmp(&(
            other.change,
            other.index,
            other.purpose,
            other.coin_type,
            other.account,
        ))
    }
}

impl PartialOrd for DerivationPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}'/{}'/{}'/{}/{}",
            self.purpose, self.coin_type, self.account, self.change, self.index
        )
    }
}

impl FromStr for DerivationPath {
    type Err = WalletError;

    /// Accepts `84'/0'/0'/0/5`, `m/84'/0'/0'/0/5` and `84h/0h/0h/0/5`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| WalletError::invalid(format!("Invalid derivation path '{}': {}", s, reason));

        let trimmed = s.trim();
        let body = trimmed.strip_prefix("m/").unwrap_or(trimmed);
        let segments: Vec<&str> = body.split('/').collect();
        if segments.len() != 5 {
            return Err(invalid("expected 5 segments"));
        }

        let mut values = [0u32; 5];
        for (position, segment) in segments.iter().enumerate() {
            let hardened = segment.ends_with('\'') || segment.ends_with('h');
            if hardened && position >= 3 {
                return Err(invalid("change and index must not be hardened"));
            }
            let digits = segment.trim_end_matches(['\'', 'h']);
            values[position] = digits
                .parse()
                .map_err(|_| invalid("segment is not a number"))?;
        }

        Self::new(values[0], values[1], values[2], values[3], values[4])
    }
}

impl TryFrom<String> for DerivationPath {
    type Error = WalletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DerivationPath> for String {
    fn from(path: DerivationPath) -> Self {
        path.to_string()
    }
}
