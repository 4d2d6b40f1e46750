use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// School day label as printed in the substitution table.
///
/// Variants are declared in calendar order; `Ord` follows it, so maps keyed
/// by `Weekday` iterate Monday first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Weekday {
    Mo,
    Di,
    Mi,
    Do,
    Fr,
}

impl Weekday {
    pub const ALL: [Weekday; 5] = [
        Weekday::Mo,
        Weekday::Di,
        Weekday::Mi,
        Weekday::Do,
        Weekday::Fr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Mo => "Mo",
            Weekday::Di => "Di",
            Weekday::Mi => "Mi",
            Weekday::Do => "Do",
            Weekday::Fr => "Fr",
        }
    }

    /// Exact, case-sensitive match on the abbreviation.
    pub fn parse_label(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substitution lines per weekday, in document order within a day.
pub type SubstitutionMap = BTreeMap<Weekday, Vec<String>>;

/// Portal login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub auth_id: String,
    pub auth_pw: String,
}

impl Credentials {
    pub fn new(auth_id: impl Into<String>, auth_pw: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
            auth_pw: auth_pw.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_id", &self.auth_id)
            .finish_non_exhaustive()
    }
}

/// Everything one update attempt needs, read once at its start.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub account_id: String,
    pub credentials: Credentials,
    pub phone_number: String,
    pub entries: SubstitutionMap,
    pub baseline_captured: bool,
    /// Revision of the stored entries this context was read at.
    pub revision: i64,
}

/// Identity of the authenticated caller, as extracted by the API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountClaims {
    pub account_id: String,
}

impl AccountClaims {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

static PHONE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{6,15}$").expect("valid phone regex"));

/// Strip spaces, dashes and slashes, then check for an optional `+` and 6-15 digits.
pub fn normalize_phone_number(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '/'))
        .collect();
    PHONE_NUMBER.is_match(&compact).then_some(compact)
}
