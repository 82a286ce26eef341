//! Reference sets the key space is built from.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::ReferenceError;
use crate::model::{cnae_digits, Category, Location};

pub trait ReferenceData: Send + Sync {
    fn list_locations(&self) -> Result<Vec<Location>, ReferenceError>;
    fn list_categories(&self) -> Result<Vec<Category>, ReferenceError>;
}

/// `locations.csv` (code,name,state,weight) and `categories.csv` (code,description).
#[derive(Debug, Clone)]
pub struct CsvReferenceData {
    locations: PathBuf,
    categories: PathBuf,
}

impl CsvReferenceData {
    pub fn new(locations: impl Into<PathBuf>, categories: impl Into<PathBuf>) -> Self {
        Self {
            locations: locations.into(),
            categories: categories.into(),
        }
    }
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ReferenceError> {
    let display = path.display().to_string();
    let file = std::fs::File::open(path).map_err(|source| ReferenceError::Io {
        path: display.clone(),
        source,
    })?;
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);
    rdr.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|source| ReferenceError::Csv {
            path: display,
            source,
        })
}

impl ReferenceData for CsvReferenceData {
    fn list_locations(&self) -> Result<Vec<Location>, ReferenceError> {
        read_rows(&self.locations)
    }

    fn list_categories(&self) -> Result<Vec<Category>, ReferenceError> {
        read_rows(&self.categories)
    }
}

/// Fixed in-memory sets.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceData {
    pub locations: Vec<Location>,
    pub categories: Vec<Category>,
}

impl ReferenceData for StaticReferenceData {
    fn list_locations(&self) -> Result<Vec<Location>, ReferenceError> {
        Ok(self.locations.clone())
    }

    fn list_categories(&self) -> Result<Vec<Category>, ReferenceError> {
        Ok(self.categories.clone())
    }
}

/// Narrows the reference sets before enumeration.
#[derive(Debug, Clone, Default)]
pub struct ReferenceFilter {
    /// Two-letter states; empty keeps all.
    pub states: Vec<String>,
    /// CNAE digit prefixes; empty keeps all.
    pub category_prefixes: Vec<String>,
}

impl ReferenceFilter {
    pub fn keeps_location(&self, location: &Location) -> bool {
        self.states.is_empty()
            || self
                .states
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(location.state.trim()))
    }

    pub fn keeps_category(&self, category: &Category) -> bool {
        let digits = category.digits();
        self.category_prefixes.is_empty()
            || self
                .category_prefixes
                .iter()
                .map(|p| cnae_digits(p))
                .any(|p| !p.is_empty() && digits.starts_with(&p))
    }
}

/// Loads both sets, applies the filter and drops duplicate codes (first wins).
/// An empty result is an error: there would be nothing to enumerate.
pub fn load(
    source: &dyn ReferenceData,
    filter: &ReferenceFilter,
) -> Result<(Vec<Location>, Vec<Category>), ReferenceError> {
    let mut seen = HashSet::new();
    let locations: Vec<Location> = source
        .list_locations()?
        .into_iter()
        .filter(|l| filter.keeps_location(l))
        .filter(|l| seen.insert(l.code.clone()))
        .collect();
    let mut seen = HashSet::new();
    let categories: Vec<Category> = source
        .list_categories()?
        .into_iter()
        .filter(|c| filter.keeps_category(c))
        .filter(|c| seen.insert(c.code.clone()))
        .collect();
    if locations.is_empty() {
        return Err(ReferenceError::Empty("locations"));
    }
    if categories.is_empty() {
        return Err(ReferenceError::Empty("categories"));
    }
    Ok((locations, categories))
}
