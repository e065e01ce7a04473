//! Line-oriented model of INI and properties configuration files.
//!
//! Edits keep comments, blank lines and the order of untouched entries so the
//! rendered file only differs where a parameter changed.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::FileFormat;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section(String),
    Entry { key: String, value: String },
    /// Comments, blank lines and anything unparsable, kept verbatim
    Verbatim(String),
}

/// A parsed configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    format: FileFormat,
    lines: Vec<Line>,
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with(';') || line.starts_with('!')
}

fn split_entry(format: FileFormat, line: &str) -> Option<(String, String)> {
    let idx = match format {
        FileFormat::Ini => line.find('='),
        FileFormat::Properties => line.find(['=', ':']),
    };
    match idx {
        Some(idx) => {
            let key = line.get(..idx)?.trim();
            let value = line.get(idx + 1..)?.trim();
            Some((key.to_string(), value.to_string()))
        }
        // Bare INI flags such as `skip-name-resolve`
        None if format == FileFormat::Ini => Some((line.to_string(), String::new())),
        None => None,
    }
}

impl ConfigFile {
    pub fn parse(format: FileFormat, text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let line = raw.trim();
                if line.is_empty() || is_comment(line) {
                    return Line::Verbatim(raw.to_string());
                }
                if format == FileFormat::Ini
                    && let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']'))
                {
                    return Line::Section(section.trim().to_string());
                }
                match split_entry(format, line) {
                    Some((key, value)) => Line::Entry { key, value },
                    None => Line::Verbatim(raw.to_string()),
                }
            })
            .collect();
        Self { format, lines }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|l| match l {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Every parameter; the first occurrence of a key wins
    pub fn parameters(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        for line in &self.lines {
            if let Line::Entry { key, value } = line {
                params.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        params
    }

    /// Set or remove one parameter.
    ///
    /// New keys go after the last entry of the first section (or the end of
    /// the file when it has no entries yet).
    pub fn set(&mut self, key: &str, value: Option<&str>) {
        match value {
            None => self
                .lines
                .retain(|l| !matches!(l, Line::Entry { key: k, .. } if k == key)),
            Some(value) => {
                let existing = self.lines.iter_mut().find_map(|l| match l {
                    Line::Entry { key: k, value } if k == key => Some(value),
                    _ => None,
                });
                if let Some(existing) = existing {
                    *existing = value.to_string();
                    return;
                }
                let at = self.insertion_point();
                self.lines.insert(
                    at,
                    Line::Entry {
                        key: key.to_string(),
                        value: value.to_string(),
                    },
                );
            }
        }
    }

    fn insertion_point(&self) -> usize {
        let mut seen_section = false;
        let mut last_entry = None;
        for (idx, line) in self.lines.iter().enumerate() {
            match line {
                Line::Section(_) if seen_section => break,
                Line::Section(_) => {
                    seen_section = true;
                    last_entry = Some(idx);
                }
                Line::Entry { .. } => last_entry = Some(idx),
                Line::Verbatim(_) => {}
            }
        }
        last_entry.map_or(self.lines.len(), |idx| idx + 1)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Section(name) => out.push_str(&format!("[{}]", name)),
                Line::Entry { key, value } if value.is_empty() && self.format == FileFormat::Ini => {
                    out.push_str(key)
                }
                Line::Entry { key, value } => out.push_str(&format!("{}={}", key, value)),
                Line::Verbatim(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }
}

/// Parameter-level difference between two versions of a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: BTreeMap<String, String>,
    pub updated: BTreeMap<String, String>,
    pub deleted: BTreeSet<String>,
}

impl ConfigDiff {
    pub fn between(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Self {
        let mut diff = ConfigDiff::default();
        for (key, value) in new {
            match old.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(prev) if prev != value => {
                    diff.updated.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        diff.deleted = old
            .keys()
            .filter(|k| !new.contains_key(*k))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn changed_keys(&self) -> impl Iterator<Item = &String> {
        self.added
            .keys()
            .chain(self.updated.keys())
            .chain(self.deleted.iter())
    }
}
