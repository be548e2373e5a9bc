//! Flat settings read from the process environment.
//!
//! Every environment variable becomes a setting. Keys are lower-cased and
//! stripped of leading digits and punctuation, so `TABLE_NAME`, `_table_name`
//! and `1TABLE_NAME` all name the setting `table_name`.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Snapshot of the current environment. Variables whose name or value
    /// is not valid unicode are skipped.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        }))
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut values = HashMap::new();
        for (key, value) in vars {
            let key = normalize(key.as_ref());
            if !key.is_empty() {
                values.insert(key, value.into());
            }
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&normalize(name)).map(String::as_str)
    }

    /// Returns the setting or fails with [`Error::ConfigNotSet`] naming it in
    /// upper case.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::ConfigNotSet(name.to_uppercase()))
    }

    /// Parses an optional setting.
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
                Error::InvalidInput(format!("setting {} = {:?}: {}", name, raw, e))
            }),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize(key: &str) -> String {
    key.to_lowercase()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c.is_ascii_punctuation())
        .to_string()
}
