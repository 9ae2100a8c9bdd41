//! Iteration order for stress scenarios.
//!
//! `Identity` keeps the caller's order. `SeededRandom` shuffles the order of
//! groups (CPU cores) and then the members within each group, drawing a new
//! permutation every round from a single RNG. The seed is always known, so a
//! failing run can be replayed exactly.

use hotplug_common::{OrderingConfig, OrderingKind, Resource};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How resources are sequenced within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "seed")]
pub enum OrderingStrategy {
    /// Fixed input order.
    Identity,
    /// Shuffled with a recorded seed.
    SeededRandom(u64),
}

impl Default for OrderingStrategy {
    fn default() -> Self {
        Self::Identity
    }
}

impl fmt::Display for OrderingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::SeededRandom(seed) => write!(f, "seeded_random(seed={seed})"),
        }
    }
}

impl OrderingStrategy {
    /// Build from configuration, drawing a fresh seed if none was given.
    pub fn from_config(config: &OrderingConfig) -> Self {
        match config.strategy {
            OrderingKind::Identity => Self::Identity,
            OrderingKind::SeededRandom => {
                Self::SeededRandom(config.seed.unwrap_or_else(rand::random))
            }
        }
    }

    /// The recorded seed, if randomized.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        match self {
            Self::Identity => None,
            Self::SeededRandom(seed) => Some(*seed),
        }
    }
}

/// Stateful order generator; each call to [`next_round`](Self::next_round)
/// yields the order for the next iteration.
#[derive(Debug)]
pub struct ResourceOrder {
    strategy: OrderingStrategy,
    rng: Option<StdRng>,
}

impl ResourceOrder {
    /// Create a generator for `strategy`.
    pub fn new(strategy: OrderingStrategy) -> Self {
        let rng = strategy.seed().map(StdRng::seed_from_u64);
        Self { strategy, rng }
    }

    /// Strategy in use.
    pub fn strategy(&self) -> OrderingStrategy {
        self.strategy
    }

    /// Order for the next round.
    pub fn next_round(&mut self, resources: &[Resource]) -> Vec<Resource> {
        match self.rng.as_mut() {
            None => resources.to_vec(),
            Some(rng) => shuffle_grouped(resources, rng),
        }
    }
}

/// Order for a single round under `strategy`.
pub fn generate_order(resources: &[Resource], strategy: OrderingStrategy) -> Vec<Resource> {
    ResourceOrder::new(strategy).next_round(resources)
}

/// Shuffle groups, then members within each group. Ungrouped resources form
/// singleton groups.
fn shuffle_grouped(resources: &[Resource], rng: &mut StdRng) -> Vec<Resource> {
    let mut groups: Vec<(Option<u32>, Vec<Resource>)> = Vec::new();
    for resource in resources {
        match resource.group {
            Some(id) => match groups.iter_mut().find(|(g, _)| *g == Some(id)) {
                Some((_, members)) => members.push(resource.clone()),
                None => groups.push((Some(id), vec![resource.clone()])),
            },
            None => groups.push((None, vec![resource.clone()])),
        }
    }

    groups.shuffle(rng);
    groups
        .into_iter()
        .flat_map(|(_, mut members)| {
            members.shuffle(rng);
            members
        })
        .collect()
}
