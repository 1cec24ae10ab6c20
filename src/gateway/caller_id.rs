use crate::validator::PhoneNumber;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

/// Strategy for choosing the outbound caller number per call. Random-uniform
/// over the provisioned inventory is the default; `Fixed` pins a manually
/// selected number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallerIdPolicy {
    Random,
    Fixed { number: PhoneNumber },
}

impl Default for CallerIdPolicy {
    fn default() -> Self {
        CallerIdPolicy::Random
    }
}

impl CallerIdPolicy {
    pub fn select(&self, available: &[PhoneNumber]) -> Option<PhoneNumber> {
        match self {
            CallerIdPolicy::Random => available.choose(&mut rand::rng()).cloned(),
            CallerIdPolicy::Fixed { number } => Some(number.clone()),
        }
    }
}
