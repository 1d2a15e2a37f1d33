use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    month::Month,
    segment::{NewBuild, PropertyType},
};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static OUTCODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\S+)").unwrap());

/// One current, validated sale. `month` is the first of the month of `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub price: u64,
    pub date: NaiveDate,
    pub month: Month,
    pub postcode_key: String,
    pub property_type: PropertyType,
    pub new_build: NewBuild,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        price: u64,
        date: NaiveDate,
        postcode: &str,
        property_type: PropertyType,
        new_build: NewBuild,
    ) -> Self {
        Self {
            id: id.into(),
            price,
            date,
            month: Month::from_date(date),
            postcode_key: normalize_postcode(postcode),
            property_type,
            new_build,
        }
    }
}

/// Join key shared by transactions and the postcode index: all whitespace
/// removed, upper-cased.
pub fn normalize_postcode(postcode: &str) -> String {
    WHITESPACE.replace_all(postcode, "").to_uppercase()
}

/// Token before the first whitespace of the original postcode, upper-cased.
pub fn outcode(postcode: &str) -> Option<String> {
    OUTCODE
        .captures(postcode)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}
