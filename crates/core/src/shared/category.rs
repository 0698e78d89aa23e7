//! Coarse matching categories and the raw-label lookup table.
//!
//! Upstream classifiers emit many fine-grained labels; identity matching
//! only ever compares within one coarse category. The mapping is an
//! explicit table so every label is accounted for and unknown labels are
//! rejected instead of silently falling into a default bucket.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CategoryError {
    #[error("unmapped detection label '{0}'")]
    Unmapped(String),
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
}

/// Partition of the identity search space (sex/age class or species).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Buck,
    Doe,
    Fawn,
    Turkey,
    Bear,
    Coyote,
    Bobcat,
    Hog,
}

impl Category {
    pub const ALL: &[Category] = &[
        Category::Buck,
        Category::Doe,
        Category::Fawn,
        Category::Turkey,
        Category::Bear,
        Category::Coyote,
        Category::Bobcat,
        Category::Hog,
    ];

    /// Map a raw classifier label to its matching category.
    pub fn from_label(label: &str) -> Result<Category, CategoryError> {
        let needle = label.trim().to_ascii_lowercase();
        LABEL_TABLE
            .iter()
            .find(|(raw, _)| *raw == needle)
            .map(|(_, category)| *category)
            .ok_or_else(|| CategoryError::Unmapped(label.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Buck => "buck",
            Category::Doe => "doe",
            Category::Fawn => "fawn",
            Category::Turkey => "turkey",
            Category::Bear => "bear",
            Category::Coyote => "coyote",
            Category::Bobcat => "bobcat",
            Category::Hog => "hog",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| CategoryError::UnknownCategory(s.to_string()))
    }
}

/// Raw label → category. Labels are matched lowercase.
pub const LABEL_TABLE: &[(&str, Category)] = &[
    ("buck", Category::Buck),
    ("mature_buck", Category::Buck),
    ("young_buck", Category::Buck),
    ("spike", Category::Buck),
    ("antlered_deer", Category::Buck),
    ("shed_buck", Category::Buck),
    ("doe", Category::Doe),
    ("antlerless_deer", Category::Doe),
    ("yearling_doe", Category::Doe),
    ("fawn", Category::Fawn),
    ("spotted_fawn", Category::Fawn),
    ("button_buck", Category::Fawn),
    ("turkey", Category::Turkey),
    ("tom", Category::Turkey),
    ("jake", Category::Turkey),
    ("hen", Category::Turkey),
    ("black_bear", Category::Bear),
    ("bear", Category::Bear),
    ("coyote", Category::Coyote),
    ("bobcat", Category::Bobcat),
    ("feral_hog", Category::Hog),
    ("hog", Category::Hog),
];
