// src/bft/validator_set.rs
// Fixed genesis validator set: voting power, quorum and leader schedule.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use super::leader_rotation::proposer_for;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub val_id: String,
    pub power: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,
    #[error("invalid validator entry '{0}' (expected val_id:power)")]
    BadEntry(String),
    #[error("duplicate validator id {0}")]
    Duplicate(String),
    #[error("validator {0} has zero power")]
    ZeroPower(String),
}

#[derive(Clone, Debug)]
pub struct ValidatorSet {
    /// Sorted by val_id.
    validators: Vec<Validator>,
    ordered_ids: Vec<String>,
    power: BTreeMap<String, u64>,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        validators.sort_by(|a, b| a.val_id.cmp(&b.val_id));
        let mut power = BTreeMap::new();
        for v in &validators {
            if v.power == 0 {
                return Err(ValidatorSetError::ZeroPower(v.val_id.clone()));
            }
            if power.insert(v.val_id.clone(), v.power as u64).is_some() {
                return Err(ValidatorSetError::Duplicate(v.val_id.clone()));
            }
        }
        let total_power = power.values().sum();
        let ordered_ids = validators.iter().map(|v| v.val_id.clone()).collect();
        Ok(Self {
            validators,
            ordered_ids,
            power,
            total_power,
        })
    }

    /// Parse `val1:1,val2:1,...`. A bare id defaults to power 1.
    pub fn parse_csv(csv: &str) -> Result<Self, ValidatorSetError> {
        let mut out = Vec::new();
        for entry in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, power) = match entry.split_once(':') {
                Some((id, p)) => {
                    let power = p
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| ValidatorSetError::BadEntry(entry.to_string()))?;
                    (id.trim(), power)
                }
                None => (entry, 1),
            };
            if id.is_empty() {
                return Err(ValidatorSetError::BadEntry(entry.to_string()));
            }
            out.push(Validator {
                val_id: id.to_string(),
                power,
            });
        }
        Self::new(out)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn contains(&self, val_id: &str) -> bool {
        self.power.contains_key(val_id)
    }

    pub fn power_of(&self, val_id: &str) -> Option<u64> {
        self.power.get(val_id).copied()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Q = floor(2 * total / 3) + 1
    pub fn quorum(&self) -> u64 {
        self.total_power * 2 / 3 + 1
    }

    /// Summed power of distinct known voters; unknown ids contribute nothing.
    pub fn power_of_set<'a, I>(&self, voters: I) -> u64
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut seen = HashSet::new();
        voters
            .into_iter()
            .filter(|v| seen.insert(v.as_str()))
            .filter_map(|v| self.power_of(v))
            .sum()
    }

    pub fn leader(&self, height: u64, round: u64) -> Option<&str> {
        proposer_for(&self.ordered_ids, height, round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_sorts() {
        let set = ValidatorSet::parse_csv("val3:1, val1:2,val2").unwrap();
        let ids: Vec<_> = set.validators().iter().map(|v| v.val_id.as_str()).collect();
        assert_eq!(ids, vec!["val1", "val2", "val3"]);
        assert_eq!(set.total_power(), 4);
        assert_eq!(set.power_of("val1"), Some(2));
        assert_eq!(set.leader(1, 0), Some("val1"));
        assert_eq!(set.leader(1, 2), Some("val3"));
    }

    #[test]
    fn quorum_is_two_thirds_plus_one() {
        let four = ValidatorSet::parse_csv("a:1,b:1,c:1,d:1").unwrap();
        assert_eq!(four.quorum(), 3);
        let three = ValidatorSet::parse_csv("a:1,b:1,c:1").unwrap();
        assert_eq!(three.quorum(), 3);
        let weighted = ValidatorSet::parse_csv("a:2,b:2,c:1").unwrap();
        assert_eq!(weighted.quorum(), 4);
    }

    #[test]
    fn rejects_bad_sets() {
        assert_eq!(ValidatorSet::parse_csv("").unwrap_err(), ValidatorSetError::Empty);
        assert_eq!(
            ValidatorSet::parse_csv("a:1,a:2").unwrap_err(),
            ValidatorSetError::Duplicate("a".into())
        );
        assert!(matches!(
            ValidatorSet::parse_csv("a:x").unwrap_err(),
            ValidatorSetError::BadEntry(_)
        ));
        assert!(matches!(
            ValidatorSet::parse_csv("a:0").unwrap_err(),
            ValidatorSetError::ZeroPower(_)
        ));
    }

    #[test]
    fn duplicate_voters_count_once() {
        let set = ValidatorSet::parse_csv("a:1,b:1,c:1,d:1").unwrap();
        let voters = vec!["a".to_string(), "a".to_string(), "zz".to_string()];
        assert_eq!(set.power_of_set(&voters), 1);
    }
}
