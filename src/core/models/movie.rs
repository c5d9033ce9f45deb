use chrono::NaiveDate;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

pub const RELEASE_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct Movie {
    pub title: String,
    #[serde(default)]
    #[builder(default)]
    pub vote_average: f64,
    /// `YYYY-MM-DD`, kept as given since some entries are malformed
    #[serde(default)]
    #[builder(default)]
    pub release_date: String,
}

impl Movie {
    pub fn released(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.release_date, RELEASE_DATE_FORMAT).ok()
    }
}
