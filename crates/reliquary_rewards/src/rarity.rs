//! # Rarity Resolver
//!
//! **Weighted tier draw over a campaign's emission table**
//!
//! The emission table maps each rarity tier to a non-negative weight. Tiers
//! are laid out on a number line in ascending tier order, each tier owning the
//! half-open range `[sum of lower weights, sum of lower weights + own weight)`.
//! A draw picks `x` uniformly in `[0, total)` and returns the tier whose range
//! contains it.
//!
//! ```text
//! weights {1:60, 2:20, 3:10, 4:8, 5:2}
//!
//!  0          60     80   90  98 100
//!  |----1-----|--2---|-3--|-4-|5|
//! ```
//!
//! When no range contains `x` (zero total weight, float edge cases) the
//! resolver falls back to the lowest tier.
//!
//! The random source is a generic [`Rng`], so draws are reproducible with a
//! seeded generator.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::types::Tier;

/// One tier and its draw weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TierWeight {
    /// The rarity tier.
    pub tier: Tier,
    /// Relative draw weight (finite, non-negative).
    pub weight: f64,
}

/// A validated emission table, sorted by ascending tier.
#[derive(Clone, Debug, PartialEq)]
pub struct EmissionTable {
    entries: Vec<TierWeight>,
}

impl EmissionTable {
    /// Builds a table from `(tier, weight)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEmissionTable` if the table is empty, a tier is zero or
    /// repeated, or a weight is negative, NaN or infinite.
    pub fn new(entries: impl IntoIterator<Item = (Tier, f64)>) -> EngineResult<Self> {
        let mut seen = BTreeSet::new();
        let mut entries: Vec<TierWeight> = entries
            .into_iter()
            .map(|(tier, weight)| {
                if tier == 0 {
                    return Err(EngineError::InvalidEmissionTable(
                        "rarity tiers must be positive".to_string(),
                    ));
                }
                if !weight.is_finite() || weight < 0.0 {
                    return Err(EngineError::InvalidEmissionTable(format!(
                        "weight for tier {tier} must be a finite non-negative number, got {weight}"
                    )));
                }
                if !seen.insert(tier) {
                    return Err(EngineError::InvalidEmissionTable(format!(
                        "tier {tier} appears twice"
                    )));
                }
                Ok(TierWeight { tier, weight })
            })
            .collect::<EngineResult<_>>()?;

        if entries.is_empty() {
            return Err(EngineError::InvalidEmissionTable(
                "emission table is empty".to_string(),
            ));
        }

        entries.sort_by_key(|e| e.tier);
        Ok(Self { entries })
    }

    /// Builds a table from a raw TOML table such as `{ 1 = 60, 2 = 20.5 }`.
    ///
    /// Keys must parse as positive integers; values must be TOML integers or
    /// floats.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEmissionTable` on a non-numeric key or weight, or any
    /// error from [`EmissionTable::new`].
    pub fn from_toml(table: &toml::Table) -> EngineResult<Self> {
        let pairs = table
            .iter()
            .map(|(key, value)| {
                let tier = key.trim().parse::<Tier>().map_err(|_| {
                    EngineError::InvalidEmissionTable(format!("tier key {key:?} is not numeric"))
                })?;
                #[allow(clippy::cast_precision_loss)]
                let weight = match value {
                    toml::Value::Integer(i) => *i as f64,
                    toml::Value::Float(f) => *f,
                    other => {
                        return Err(EngineError::InvalidEmissionTable(format!(
                            "weight for tier {key} is not numeric: {}",
                            other.type_str()
                        )))
                    }
                };
                Ok((tier, weight))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Self::new(pairs)
    }

    /// Entries in ascending tier order.
    #[must_use]
    pub fn entries(&self) -> &[TierWeight] {
        &self.entries
    }

    /// Sum of all weights.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    /// The smallest tier value (fallback tier).
    #[must_use]
    pub fn min_tier(&self) -> Tier {
        // Non-empty by construction.
        self.entries.first().map_or(1, |e| e.tier)
    }

    /// Weight configured for `tier`, if any.
    #[must_use]
    pub fn weight_of(&self, tier: Tier) -> Option<f64> {
        self.entries.iter().find(|e| e.tier == tier).map(|e| e.weight)
    }
}

/// Cumulative range owned by one tier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TierRange {
    /// The tier.
    pub tier: Tier,
    /// Inclusive lower bound.
    pub start: f64,
    /// Exclusive upper bound.
    pub end: f64,
}

impl TierRange {
    /// Returns true if `x` lies in `[start, end)`.
    #[inline]
    #[must_use]
    pub fn contains(&self, x: f64) -> bool {
        x >= self.start && x < self.end
    }
}

/// Resolves random draws to rarity tiers.
///
/// Built once per campaign; a draw is a single binary search.
#[derive(Clone, Debug)]
pub struct RarityResolver {
    ranges: Vec<TierRange>,
    total_weight: f64,
    min_tier: Tier,
}

impl RarityResolver {
    /// Pre-computes the cumulative ranges of `table`.
    #[must_use]
    pub fn new(table: &EmissionTable) -> Self {
        let mut cumulative = 0.0;
        let ranges = table
            .entries()
            .iter()
            .map(|e| {
                let start = cumulative;
                cumulative += e.weight;
                TierRange {
                    tier: e.tier,
                    start,
                    end: cumulative,
                }
            })
            .collect();

        Self {
            ranges,
            total_weight: cumulative,
            min_tier: table.min_tier(),
        }
    }

    /// The cumulative ranges in ascending tier order.
    #[must_use]
    pub fn ranges(&self) -> &[TierRange] {
        &self.ranges
    }

    /// Sum of all weights.
    #[must_use]
    pub const fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// The tier whose range contains `x`, if any.
    #[must_use]
    pub fn lookup(&self, x: f64) -> Option<Tier> {
        // Range ends are non-decreasing, so this is a valid partition.
        let idx = self.ranges.partition_point(|r| r.end <= x);
        self.ranges
            .get(idx)
            .filter(|r| r.contains(x))
            .map(|r| r.tier)
    }

    /// The tier for `x`, falling back to the lowest tier on a miss.
    #[must_use]
    pub fn tier_at(&self, x: f64) -> Tier {
        self.lookup(x).unwrap_or(self.min_tier)
    }

    /// Draws one tier.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> Tier {
        let x = rng.gen::<f64>() * self.total_weight;
        self.lookup(x).unwrap_or_else(|| {
            tracing::debug!(
                "rarity draw {} missed every range (total weight {}), falling back to tier {}",
                x,
                self.total_weight,
                self.min_tier
            );
            self.min_tier
        })
    }

    /// Draws `iterations` tiers and counts them.
    pub fn statistics<R: Rng + ?Sized>(&self, iterations: u64, rng: &mut R) -> RarityStatistics {
        let mut stats = RarityStatistics::default();
        for _ in 0..iterations {
            *stats.tier_counts.entry(self.resolve(rng)).or_insert(0) += 1;
            stats.total_draws += 1;
        }
        stats
    }
}

/// Observed tier frequencies from repeated draws.
#[derive(Clone, Debug, Default)]
pub struct RarityStatistics {
    /// Number of draws performed.
    pub total_draws: u64,
    /// Draw counts by tier.
    pub tier_counts: BTreeMap<Tier, u64>,
}

impl RarityStatistics {
    /// Pearson's chi-square statistic of the observed counts against the
    /// proportions of `table`.
    ///
    /// Tiers with zero expected frequency are skipped; an observation in such a
    /// tier yields infinity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn chi_square(&self, table: &EmissionTable) -> f64 {
        let total_weight = table.total_weight();
        if total_weight <= 0.0 || self.total_draws == 0 {
            return 0.0;
        }

        let n = self.total_draws as f64;
        let mut chi = 0.0;
        for entry in table.entries() {
            let observed = self.tier_counts.get(&entry.tier).copied().unwrap_or(0) as f64;
            let expected = n * entry.weight / total_weight;
            if expected == 0.0 {
                if observed > 0.0 {
                    return f64::INFINITY;
                }
                continue;
            }
            chi += (observed - expected).powi(2) / expected;
        }
        chi
    }

    /// Degrees of freedom for [`Self::chi_square`]: non-zero tiers minus one.
    #[must_use]
    pub fn degrees_of_freedom(table: &EmissionTable) -> usize {
        table
            .entries()
            .iter()
            .filter(|e| e.weight > 0.0)
            .count()
            .saturating_sub(1)
    }
}
