use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Filter value meaning "no constraint on this dimension".
pub const ALL: &str = "all";

/// One of the three axes a dashboard query can be narrowed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKey {
    TimePeriod,
    Representation,
    CaseType,
}

impl FilterKey {
    /// Iteration order used for query strings and summaries.
    pub const DIMENSIONS: [FilterKey; 3] = [
        FilterKey::TimePeriod,
        FilterKey::Representation,
        FilterKey::CaseType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKey::TimePeriod => "time_period",
            FilterKey::Representation => "representation",
            FilterKey::CaseType => "case_type",
        }
    }

    /// Query parameter names accepted for this dimension, in priority order.
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            FilterKey::TimePeriod => &["time_period", "timePeriod"],
            FilterKey::Representation => &["representation"],
            FilterKey::CaseType => &["case_type", "caseType"],
        }
    }

    /// Known values and their display labels.
    pub fn labels(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            FilterKey::TimePeriod => &[
                ("all", "All Years (2018-2025)"),
                ("trump1", "Trump I Era (2018-2020)"),
                ("biden", "Biden Era (2021-2024)"),
                ("trump2", "Trump II Era (2025+)"),
            ],
            FilterKey::Representation => &[
                ("all", "All Cases"),
                ("represented", "With Legal Representation"),
                ("unrepresented", "Without Representation"),
            ],
            FilterKey::CaseType => &[("all", "All Types")],
        }
    }

    /// Display label for `value`, or the raw value when it has none.
    pub fn label<'a>(&self, value: &'a str) -> &'a str {
        self.labels()
            .iter()
            .find(|(known, _)| *known == value)
            .map(|(_, label)| *label)
            .unwrap_or(value)
    }
}

impl AsRef<str> for FilterKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFilterKey(pub String);

impl fmt::Display for UnknownFilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown filter '{}'", self.0)
    }
}

impl std::error::Error for UnknownFilterKey {}

impl FromStr for FilterKey {
    type Err = UnknownFilterKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterKey::DIMENSIONS
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownFilterKey(s.to_string()))
    }
}

/// Current selection across all filter dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub time_period: String,
    pub representation: String,
    pub case_type: String,
}

impl Default for FilterSet {
    fn default() -> Self {
        Self {
            time_period: ALL.to_string(),
            representation: ALL.to_string(),
            case_type: ALL.to_string(),
        }
    }
}

impl FilterSet {
    pub fn get(&self, key: FilterKey) -> &str {
        match key {
            FilterKey::TimePeriod => &self.time_period,
            FilterKey::Representation => &self.representation,
            FilterKey::CaseType => &self.case_type,
        }
    }

    /// Returns true if the stored value actually changed.
    pub fn set(&mut self, key: FilterKey, value: &str) -> bool {
        let slot = match key {
            FilterKey::TimePeriod => &mut self.time_period,
            FilterKey::Representation => &mut self.representation,
            FilterKey::CaseType => &mut self.case_type,
        };
        if slot.as_str() == value {
            return false;
        }
        *slot = value.to_string();
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (FilterKey, &str)> {
        FilterKey::DIMENSIONS.into_iter().map(move |key| (key, self.get(key)))
    }

    /// Dimensions that constrain a query, i.e. everything not set to `"all"`.
    pub fn constrained(&self) -> impl Iterator<Item = (FilterKey, &str)> {
        self.iter().filter(|(_, value)| !value.is_empty() && *value != ALL)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.constrained().next().is_none()
    }

    /// Form-encoded query string of the constrained dimensions, without a
    /// leading `?`. Used for backend requests, so empty values are skipped too.
    pub fn to_query_string(&self) -> String {
        encode_pairs(self.constrained())
    }

    /// Form-encoded query string of every dimension not set to `"all"`, for
    /// mirroring the selection into a page URL.
    pub fn to_query_params(&self) -> String {
        encode_pairs(self.iter().filter(|(_, value)| *value != ALL))
    }
}

fn encode_pairs<'a>(pairs: impl Iterator<Item = (FilterKey, &'a str)>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key.as_str(), value);
    }
    serializer.finish()
}

/// Valid values per dimension, as served by `/meta/options`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(default)]
    pub time_period: Vec<String>,
    #[serde(default)]
    pub representation: Vec<String>,
    #[serde(default)]
    pub case_type: Vec<String>,
}

impl FilterOptions {
    /// Option set used when the backend cannot be asked.
    pub fn fallback() -> Self {
        let owned = |values: &[&str]| -> Vec<String> {
            values.iter().map(|v| v.to_string()).collect()
        };
        Self {
            time_period: owned(&["all", "trump1", "biden", "trump2"]),
            representation: owned(&["all", "represented", "unrepresented"]),
            case_type: owned(&["all"]),
        }
    }

    pub fn values(&self, key: FilterKey) -> &[String] {
        match key {
            FilterKey::TimePeriod => &self.time_period,
            FilterKey::Representation => &self.representation,
            FilterKey::CaseType => &self.case_type,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OptionsResponse {
    pub options: FilterOptions,
}

/// A dimension that differs from its default, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveFilter {
    #[serde(rename = "type")]
    pub key: FilterKey,
    pub value: String,
    pub label: String,
}

pub type FilterLabels = BTreeMap<FilterKey, BTreeMap<&'static str, &'static str>>;

pub fn filter_labels() -> FilterLabels {
    FilterKey::DIMENSIONS
        .into_iter()
        .map(|key| (key, key.labels().iter().copied().collect()))
        .collect()
}
