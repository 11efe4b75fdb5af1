use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

lazy_static! {
    // What is left of a prefix once trailing underscores are gone
    static ref PREFIX_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap();
}

const NESTED_DELIM: &str = "__";
const POSITIONAL_DELIM: char = '_';

/// Highest index an indexed key may use; the record list is padded up to it.
pub const MAX_INDEX: usize = 1024;

/// Sub-label to value; one element of an indexed label.
pub type Record = BTreeMap<String, String>;

/// The emitted mapping. Keys are sorted so consecutive emissions serialize identically.
pub type Labels = BTreeMap<String, LabelValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LabelValue {
    Scalar(String),
    Records(Vec<Record>),
}

/// How an indexed key is spelled after the prefix is removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyStyle {
    /// `<label>__<index>__<sub-label>`
    #[default]
    Nested,

    /// `<label>_<index>_<sub-label>`, exactly three parts
    Positional,
}

impl FromStr for KeyStyle {
    type Err = LabelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nested" => Ok(KeyStyle::Nested),
            "positional" => Ok(KeyStyle::Positional),
            _ => Err(LabelError::UnknownKeyStyle(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label prefix is empty")]
    EmptyPrefix,

    #[error("label prefix '{0}' is not supported: prefixes are restricted to letters, digits, '_' and '-' so they can be matched against environment variable names")]
    InvalidPrefix(String),

    #[error("'{key}': index '{index}' is not an integer between 0 and {max}", max = MAX_INDEX)]
    InvalidIndex { key: String, index: String },

    #[error("'{0}': indexed key is missing its label or sub-label")]
    MalformedKey(String),

    #[error("'{key}': label '{label}' is already set by another variable")]
    LabelConflict { key: String, label: String },

    #[error("unknown key style '{0}', expected 'nested' or 'positional'")]
    UnknownKeyStyle(String),
}

pub type Result<T> = std::result::Result<T, LabelError>;

/// Turns prefixed environment variables into namespaced labels.
#[derive(Clone, Debug)]
pub struct Extractor {
    prefix: String,
    namespace: String,
    style: KeyStyle,
    reserved: HashSet<String>,
}

impl Extractor {
    pub fn new(prefix: &str, style: KeyStyle) -> Result<Self> {
        let prefix = normalize_prefix(prefix)?;
        let namespace = normalize(&prefix);

        Ok(Self {
            prefix,
            namespace,
            style,
            reserved: HashSet::new(),
        })
    }

    /// Replaces the namespace derived from the prefix.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        let namespace = namespace.trim_end_matches('/');
        if !namespace.is_empty() {
            self.namespace = namespace.to_string();
        }
        self
    }

    /// Variables that match the prefix but must never become labels.
    pub fn with_reserved<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn style(&self) -> KeyStyle {
        self.style
    }

    pub fn extract<'a, I>(&self, env: I) -> Result<Labels>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut labels = Labels::new();

        for (key, value) in env {
            let Some(residual) = self.residual(key) else {
                continue;
            };

            match self.split_indexed(key, residual)? {
                Some((label, index, sub_label)) => {
                    self.set_record(&mut labels, key, label, index, sub_label, value)?
                }
                None => self.set_scalar(&mut labels, key, residual, value)?,
            }
        }

        Ok(labels)
    }

    // Whatever follows "<prefix>_", if the key is ours
    fn residual<'k>(&self, key: &'k str) -> Option<&'k str> {
        if self.reserved.contains(key) {
            return None;
        }

        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')
            .filter(|rest| !rest.is_empty())
    }

    fn split_indexed<'k>(&self, key: &str, residual: &'k str) -> Result<Option<(&'k str, usize, &'k str)>> {
        let parts: Vec<&str> = match self.style {
            KeyStyle::Nested => residual.split(NESTED_DELIM).collect(),
            KeyStyle::Positional => residual.split(POSITIONAL_DELIM).collect(),
        };

        match parts.as_slice() {
            [label, index, sub_label] => {
                if label.is_empty() || sub_label.is_empty() {
                    return Err(LabelError::MalformedKey(key.to_string()));
                }
                let index = parse_index(key, index)?;
                Ok(Some((*label, index, *sub_label)))
            }
            // plain labels, including multi-word ones such as MANAGED_BY or FOO__BAR
            _ => Ok(None),
        }
    }

    fn set_scalar(&self, labels: &mut Labels, key: &str, residual: &str, value: &str) -> Result<()> {
        let label = self.label_key(residual);
        if labels.contains_key(&label) {
            return Err(LabelError::LabelConflict { key: key.to_string(), label });
        }

        labels.insert(label, LabelValue::Scalar(value.to_string()));
        Ok(())
    }

    fn set_record(
        &self,
        labels: &mut Labels,
        key: &str,
        label: &str,
        index: usize,
        sub_label: &str,
        value: &str,
    ) -> Result<()> {
        let label = self.label_key(label);

        let records = match labels
            .entry(label.clone())
            .or_insert_with(|| LabelValue::Records(Vec::new()))
        {
            LabelValue::Records(records) => records,
            LabelValue::Scalar(_) => {
                return Err(LabelError::LabelConflict { key: key.to_string(), label })
            }
        };

        if records.len() <= index {
            records.resize_with(index + 1, Record::new);
        }

        let sub_label = normalize(sub_label);
        if records[index].contains_key(&sub_label) {
            return Err(LabelError::LabelConflict {
                key: key.to_string(),
                label: format!("{label}[{index}].{sub_label}"),
            });
        }

        records[index].insert(sub_label, value.to_string());
        Ok(())
    }

    fn label_key(&self, label: &str) -> String {
        format!("{}/{}", self.namespace, normalize(label))
    }
}

fn normalize_prefix(prefix: &str) -> Result<String> {
    let prefix = prefix.trim_end_matches('_');
    if prefix.is_empty() {
        return Err(LabelError::EmptyPrefix);
    }

    if !PREFIX_RE.is_match(prefix) {
        return Err(LabelError::InvalidPrefix(prefix.to_string()));
    }

    Ok(prefix.to_string())
}

fn parse_index(key: &str, index: &str) -> Result<usize> {
    let invalid = || LabelError::InvalidIndex {
        key: key.to_string(),
        index: index.to_string(),
    };

    // usize::from_str would also take "+1"
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    match index.parse::<usize>() {
        Ok(index) if index <= MAX_INDEX => Ok(index),
        _ => Err(invalid()),
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase().replace(['_', '-'], ".")
}
