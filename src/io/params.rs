//! Common-parameters file shared by the pipeline stages.
//!
//! A sectioned key/value text file. The spectrogram builder establishes the
//! run parameters once and every later stage reads (and selectively extends)
//! the same file, so section and key order are preserved across a
//! load/modify/save cycle. Keys are case-insensitive and stored lowercase.

use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("could not open or read common parameters file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write common parameters file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing section [{0}] in common parameters file")]
    MissingSection(String),
    #[error("missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },
    #[error("invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// In-memory view of the parameters file.
#[derive(Debug, Default, Clone)]
pub struct ParamsFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl ParamsFile {
    pub fn new() -> Self {
        ParamsFile::default()
    }

    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let text = fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut params = ParamsFile::new();
        let mut current: Option<usize> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                current = Some(params.section_index(name));
                continue;
            }
            if let (Some(idx), Some((key, value))) = (current, line.split_once('=')) {
                params.sections[idx]
                    .1
                    .push((key.trim().to_lowercase(), value.trim().to_string()));
            }
        }
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<(), ParamsError> {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push_str(&format!("[{name}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key} = {value}\n"));
            }
            out.push('\n');
        }
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(out.as_bytes())?;
            file.flush()
        };
        write(path).map_err(|source| ParamsError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.iter().any(|(name, _)| name == section)
    }

    fn section_index(&mut self, section: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|(name, _)| name == section) {
            idx
        } else {
            self.sections.push((section.to_string(), Vec::new()));
            self.sections.len() - 1
        }
    }

    /// Insert or overwrite one key.
    pub fn set(&mut self, section: &str, key: &str, value: impl Display) {
        let idx = self.section_index(section);
        let key = key.to_lowercase();
        let value = value.to_string();
        let entries = &mut self.sections[idx].1;
        if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            entries.push((key, value));
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.sections
            .iter()
            .find(|(name, _)| name == section)?
            .1
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, section: &str, key: &str) -> Result<&str, ParamsError> {
        if !self.has_section(section) {
            return Err(ParamsError::MissingSection(section.to_string()));
        }
        self.get(section, key).ok_or_else(|| ParamsError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    fn invalid(&self, section: &str, key: &str, value: &str) -> ParamsError {
        ParamsError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn get_str(&self, section: &str, key: &str) -> Result<String, ParamsError> {
        self.require(section, key).map(str::to_string)
    }

    pub fn get_f64(&self, section: &str, key: &str) -> Result<f64, ParamsError> {
        let value = self.require(section, key)?;
        value.parse().map_err(|_| self.invalid(section, key, value))
    }

    pub fn get_i64(&self, section: &str, key: &str) -> Result<i64, ParamsError> {
        let value = self.require(section, key)?;
        value.parse().map_err(|_| self.invalid(section, key, value))
    }

    pub fn get_usize(&self, section: &str, key: &str) -> Result<usize, ParamsError> {
        let value = self.require(section, key)?;
        value.parse().map_err(|_| self.invalid(section, key, value))
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Result<bool, ParamsError> {
        let value = self.require(section, key)?;
        match value.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(self.invalid(section, key, value)),
        }
    }
}
