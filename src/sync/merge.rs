//! Merge engine: combines the packs of one user into one bounded snapshot
//!
//! Each field is resolved by a strategy looked up by field path
//! (`facts.<key>`, `recents.<category>`, `pointers.<category>`), falling back
//! to the section default (`facts.*`, ...) and then to the built-in default.
//! Merging is a pure function of the pack set: packs are put in a canonical
//! order first, so the result does not depend on the order they arrived in.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pack::{
    ContextPack, ContextSnapshot, ContributingSource, MergedPayload, NAMESPACE_SEPARATOR,
    PackLimits, SNAPSHOT_SCHEMA_VERSION, dedup_values,
};

/// How one field is resolved across packs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// First value in configured source priority order
    PriorityWinner,
    /// Value from the most recently generated pack; ties go to the smaller source id
    FreshestWinner,
    /// Concatenate most-recent-first, dedup by reference id, cap
    UnionDedup,
    /// Keep every source's value under its source id
    Namespaced,
}

/// Top-level pack sections a field path can start with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Facts,
    Recents,
    Pointers,
}

impl Section {
    const fn name(self) -> &'static str {
        match self {
            Self::Facts => "facts",
            Self::Recents => "recents",
            Self::Pointers => "pointers",
        }
    }

    const fn default_strategy(self) -> MergeStrategy {
        match self {
            Self::Facts => MergeStrategy::PriorityWinner,
            Self::Recents | Self::Pointers => MergeStrategy::UnionDedup,
        }
    }
}

/// Static merge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Source ids, highest priority first; unlisted sources rank after, by id
    pub source_priority: Vec<String>,
    /// Field path to strategy
    pub strategies: BTreeMap<String, MergeStrategy>,
}

impl MergeConfig {
    /// Strategy for `section.key`
    #[must_use]
    pub fn strategy_for(&self, section: Section, key: &str) -> MergeStrategy {
        let name = section.name();
        self.strategies
            .get(&format!("{name}.{key}"))
            .or_else(|| self.strategies.get(&format!("{name}.*")))
            .copied()
            .unwrap_or_else(|| section.default_strategy())
    }

    fn rank(&self, source_id: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(usize::MAX)
    }
}

/// A priority/freshest field where sources disagreed
///
/// Only a hash of the losing value is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub field: String,
    pub winner: String,
    pub loser: String,
    pub loser_hash: String,
}

/// Result of a merge
#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub snapshot: ContextSnapshot,
    pub conflicts: Vec<Conflict>,
}

/// Merges packs using a static strategy table and size caps
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
    limits: PackLimits,
}

impl MergeEngine {
    /// Create a merge engine
    #[must_use]
    pub const fn new(config: MergeConfig, limits: PackLimits) -> Self {
        Self { config, limits }
    }

    /// Merge `packs` for `user_id`
    ///
    /// Returns `None` when there is nothing to merge, so the caller keeps the
    /// previous snapshot instead of storing an empty one.
    #[must_use]
    pub fn merge<'a>(
        &self,
        user_id: &str,
        packs: &'a [ContextPack],
        created_at: DateTime<Utc>,
    ) -> Option<MergeOutput> {
        let packs = canonical(packs);
        let generated_at = packs.iter().map(|p| p.generated_at).max()?;

        let by_priority = self.by_priority(&packs);
        let by_freshness = by_freshness(&packs);
        let mut conflicts = Vec::new();

        let mut facts = BTreeMap::new();
        let keys: BTreeSet<&String> = packs.iter().flat_map(|p| p.facts.keys()).collect();
        for key in keys {
            let field = format!("facts.{key}");
            let present = |order: &[&'a ContextPack]| fact_candidates(order, key);

            let merged = match self.config.strategy_for(Section::Facts, key) {
                MergeStrategy::PriorityWinner => {
                    pick_winner(&field, &present(&by_priority), &mut conflicts).cloned()
                }
                MergeStrategy::FreshestWinner => {
                    pick_winner(&field, &present(&by_freshness), &mut conflicts).cloned()
                }
                MergeStrategy::UnionDedup => {
                    let entries = present(&by_freshness)
                        .into_iter()
                        .flat_map(|(_, v)| match v {
                            Value::Array(items) => items.clone(),
                            other => vec![other.clone()],
                        })
                        .collect();
                    let mut entries = dedup_values(entries);
                    entries.truncate(self.limits.recents_max_count);
                    Some(Value::Array(entries))
                }
                MergeStrategy::Namespaced => {
                    let by_source = present(&by_priority)
                        .into_iter()
                        .map(|(source, v)| (source.to_string(), v.clone()))
                        .collect::<BTreeMap<_, _>>();
                    Some(Value::Object(by_source.into_iter().collect()))
                }
            };

            if let Some(value) = merged {
                facts.insert(key.clone(), value);
            }
        }
        self.limits.cap_facts(&mut facts);

        let recents = self.merge_lists(
            Section::Recents,
            &by_priority,
            &by_freshness,
            |p| &p.recents,
            |entries: Vec<Value>| {
                let mut entries = dedup_values(entries);
                entries.truncate(self.limits.recents_max_count);
                entries
            },
            &mut conflicts,
        );

        let pointers = self.merge_lists(
            Section::Pointers,
            &by_priority,
            &by_freshness,
            |p| &p.pointers,
            |ids: Vec<String>| {
                let mut seen = BTreeSet::new();
                ids.into_iter()
                    .filter(|id| seen.insert(id.clone()))
                    .take(self.limits.pointers_max_per_category)
                    .collect()
            },
            &mut conflicts,
        );

        let sources = packs.iter().copied().map(ContributingSource::from).collect();

        let payload = MergedPayload {
            schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
            generated_at,
            facts,
            recents,
            pointers,
            sources,
        };

        Some(MergeOutput {
            snapshot: ContextSnapshot::new(user_id, payload, created_at),
            conflicts,
        })
    }

    /// Merge a category → list section
    fn merge_lists<'a, T, F, U>(
        &self,
        section: Section,
        by_priority: &[&'a ContextPack],
        by_freshness: &[&'a ContextPack],
        lists: F,
        union: U,
        conflicts: &mut Vec<Conflict>,
    ) -> BTreeMap<String, Vec<T>>
    where
        T: Clone + PartialEq + Serialize + 'a,
        F: Fn(&'a ContextPack) -> &'a BTreeMap<String, Vec<T>>,
        U: Fn(Vec<T>) -> Vec<T>,
    {
        let mut merged = BTreeMap::new();
        let categories: BTreeSet<&String> = by_freshness
            .iter()
            .flat_map(|&p| lists(p).keys())
            .collect();

        for category in categories {
            let field = format!("{}.{category}", section.name());
            let present = |order: &[&'a ContextPack]| -> Vec<(&'a str, &'a Vec<T>)> {
                order
                    .iter()
                    .filter_map(|&p| lists(p).get(category).map(|v| (p.source_id.as_str(), v)))
                    .collect()
            };

            match self.config.strategy_for(section, category) {
                MergeStrategy::UnionDedup => {
                    let entries = present(by_freshness)
                        .into_iter()
                        .flat_map(|(_, v)| v.iter().cloned())
                        .collect();
                    merged.insert(category.clone(), union(entries));
                }
                MergeStrategy::PriorityWinner => {
                    if let Some(list) = pick_winner(&field, &present(by_priority), conflicts) {
                        merged.insert(category.clone(), list.clone());
                    }
                }
                MergeStrategy::FreshestWinner => {
                    if let Some(list) = pick_winner(&field, &present(by_freshness), conflicts) {
                        merged.insert(category.clone(), list.clone());
                    }
                }
                MergeStrategy::Namespaced => {
                    for (source, list) in present(by_priority) {
                        merged.insert(format!("{category}{NAMESPACE_SEPARATOR}{source}"), list.clone());
                    }
                }
            }
        }

        merged
    }

    fn by_priority<'a>(&self, packs: &[&'a ContextPack]) -> Vec<&'a ContextPack> {
        let mut ordered = packs.to_vec();
        ordered.sort_by(|a, b| {
            self.config
                .rank(&a.source_id)
                .cmp(&self.config.rank(&b.source_id))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        ordered
    }
}

/// One pack per source (the newest), ordered by source id
fn canonical(packs: &[ContextPack]) -> Vec<&ContextPack> {
    let mut ordered: Vec<&ContextPack> = packs.iter().collect();
    ordered.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| b.generated_at.cmp(&a.generated_at))
    });
    ordered.dedup_by(|later, earlier| later.source_id == earlier.source_id);
    ordered
}

/// Non-null values of `facts.<key>` in the given source order
fn fact_candidates<'a>(order: &[&'a ContextPack], key: &str) -> Vec<(&'a str, &'a Value)> {
    order
        .iter()
        .filter_map(|&p| {
            p.facts
                .get(key)
                .filter(|v| !v.is_null())
                .map(|v| (p.source_id.as_str(), v))
        })
        .collect()
}

/// Most recently generated first; ties broken by source id
fn by_freshness<'a>(packs: &[&'a ContextPack]) -> Vec<&'a ContextPack> {
    let mut ordered = packs.to_vec();
    ordered.sort_by(|a, b| {
        b.generated_at
            .cmp(&a.generated_at)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    ordered
}

/// First candidate wins; every disagreeing candidate is recorded as a conflict
fn pick_winner<'a, T: PartialEq + Serialize>(
    field: &str,
    candidates: &[(&str, &'a T)],
    conflicts: &mut Vec<Conflict>,
) -> Option<&'a T> {
    let (&(winner, value), rest) = candidates.split_first()?;

    for &(loser, other) in rest {
        if other != value {
            conflicts.push(Conflict {
                field: field.to_string(),
                winner: winner.to_string(),
                loser: loser.to_string(),
                loser_hash: value_hash(other),
            });
        }
    }

    Some(value)
}

fn value_hash<T: Serialize>(value: &T) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    hex::encode(hasher.finalize())
}
