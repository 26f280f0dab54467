use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::pipeline::LocatedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDimension {
    Category,
    FacilityType,
    Authority,
    Country,
    Provenance,
}

impl FilterDimension {
    pub const ALL: [FilterDimension; 5] = [
        FilterDimension::Category,
        FilterDimension::FacilityType,
        FilterDimension::Authority,
        FilterDimension::Country,
        FilterDimension::Provenance,
    ];

    /// The values a record carries along this dimension.
    pub fn values_of<'a>(&self, record: &'a LocatedRecord) -> Vec<&'a str> {
        let location = &record.location;
        match self {
            FilterDimension::Category => location.category_values(),
            FilterDimension::FacilityType => {
                location.facility_types.iter().map(String::as_str).collect()
            }
            FilterDimension::Authority => location.authority.as_deref().into_iter().collect(),
            FilterDimension::Country => location.country.as_deref().into_iter().collect(),
            FilterDimension::Provenance => vec![record.provenance.as_str()],
        }
    }
}

/// Accepted values per dimension. A missing or empty set leaves that
/// dimension unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    dimensions: BTreeMap<FilterDimension, BTreeSet<String>>,
}

impl FilterCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(mut self, dimension: FilterDimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(dimension, values);
        self
    }

    pub fn set<I, S>(&mut self, dimension: FilterDimension, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimensions
            .insert(dimension, values.into_iter().map(Into::into).collect());
    }

    /// Adds the value when absent, removes it when present.
    pub fn toggle(&mut self, dimension: FilterDimension, value: &str) {
        let accepted = self.dimensions.entry(dimension).or_default();
        if !accepted.remove(value) {
            accepted.insert(value.to_string());
        }
    }

    pub fn clear(&mut self, dimension: FilterDimension) {
        self.dimensions.remove(&dimension);
    }

    pub fn clear_all(&mut self) {
        self.dimensions.clear();
    }

    pub fn accepted(&self, dimension: FilterDimension) -> Option<&BTreeSet<String>> {
        self.dimensions.get(&dimension).filter(|set| !set.is_empty())
    }

    pub fn is_unconstrained(&self) -> bool {
        self.dimensions.values().all(BTreeSet::is_empty)
    }

    pub fn matches(&self, record: &LocatedRecord) -> bool {
        self.dimensions
            .iter()
            .filter(|(_, accepted)| !accepted.is_empty())
            .all(|(dimension, accepted)| {
                dimension
                    .values_of(record)
                    .iter()
                    .any(|value| accepted.contains(*value))
            })
    }
}

pub fn apply(records: &[LocatedRecord], criteria: &FilterCriteria) -> Vec<LocatedRecord> {
    if criteria.is_unconstrained() {
        return records.to_vec();
    }
    records
        .iter()
        .filter(|record| criteria.matches(record))
        .cloned()
        .collect()
}

/// Distinct values present per dimension, for populating filter controls.
pub fn facets(records: &[LocatedRecord]) -> BTreeMap<FilterDimension, BTreeSet<String>> {
    FilterDimension::ALL
        .iter()
        .map(|dimension| {
            let values = records
                .iter()
                .flat_map(|record| dimension.values_of(record))
                .map(str::to_string)
                .collect();
            (*dimension, values)
        })
        .collect()
}
