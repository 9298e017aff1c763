use crate::sources::PluginReader;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const RECORD_HEADER_LEN: usize = 24;
const SUBRECORD_HEADER_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum PluginReadError {
    #[error("plugin not found: {0}")]
    NotFound(String),
    #[error("not a plugin file (missing TES4 header)")]
    NotAPlugin,
    #[error("plugin header truncated")]
    Truncated,
    #[error("read plugin: {0}")]
    Io(#[from] io::Error),
}

pub fn is_plugin_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".esp") || lower.ends_with(".esm") || lower.ends_with(".esl")
}

/// Installer file names may carry the archive folder they came from.
pub fn plugin_base_name(file_name: &str) -> &str {
    file_name
        .rsplit(|ch| ch == '/' || ch == '\\')
        .next()
        .unwrap_or(file_name)
}

pub fn is_valid_plugin(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut signature = [0u8; 4];
    file.read_exact(&mut signature).is_ok() && &signature == b"TES4"
}

pub fn read_masters(path: &Path) -> Result<Vec<String>, PluginReadError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; RECORD_HEADER_LEN];
    file.read_exact(&mut header).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => PluginReadError::Truncated,
        _ => PluginReadError::Io(err),
    })?;
    if &header[..4] != b"TES4" {
        return Err(PluginReadError::NotAPlugin);
    }
    let data_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut data = Vec::with_capacity(data_len.min(1 << 20));
    file.take(data_len as u64).read_to_end(&mut data)?;
    if data.len() < data_len {
        return Err(PluginReadError::Truncated);
    }
    parse_masters(&data)
}

/// Walks the TES4 record body and collects every `MAST` subrecord in order.
pub fn parse_masters(data: &[u8]) -> Result<Vec<String>, PluginReadError> {
    let mut masters = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if offset + SUBRECORD_HEADER_LEN > data.len() {
            return Err(PluginReadError::Truncated);
        }
        let kind = &data[offset..offset + 4];
        let size = u16::from_le_bytes([data[offset + 4], data[offset + 5]]) as usize;
        let start = offset + SUBRECORD_HEADER_LEN;
        let end = start + size;
        if end > data.len() {
            return Err(PluginReadError::Truncated);
        }
        if kind == b"MAST" {
            let raw = &data[start..end];
            let raw = raw.split(|byte| *byte == 0).next().unwrap_or(raw);
            let name = String::from_utf8_lossy(raw).trim().to_string();
            if !name.is_empty() {
                masters.push(name);
            }
        }
        offset = end;
    }
    Ok(masters)
}

/// Finds plugin files under a set of root folders by case-insensitive file
/// name and remembers the masters of every plugin it has read.
pub struct PluginDirReader {
    roots: Vec<PathBuf>,
    index: Mutex<Option<HashMap<String, PathBuf>>>,
    masters: Mutex<HashMap<String, Vec<String>>>,
}

impl PluginDirReader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            index: Mutex::new(None),
            masters: Mutex::new(HashMap::new()),
        }
    }

    pub fn locate(&self, plugin: &str) -> Option<PathBuf> {
        let key = plugin_base_name(plugin).to_lowercase();
        let mut index = self.index.lock();
        let index = index.get_or_insert_with(|| build_plugin_index(&self.roots));
        index.get(&key).cloned()
    }

    pub fn cached_plugins(&self) -> usize {
        self.masters.lock().len()
    }
}

impl PluginReader for PluginDirReader {
    fn declared_masters(&self, plugin: &str) -> Result<Vec<String>, PluginReadError> {
        let key = plugin_base_name(plugin).to_lowercase();
        if let Some(masters) = self.masters.lock().get(&key) {
            return Ok(masters.clone());
        }
        let path = self
            .locate(plugin)
            .ok_or_else(|| PluginReadError::NotFound(plugin_base_name(plugin).to_string()))?;
        let masters = read_masters(&path)?;
        debug!(plugin = %key, count = masters.len(), "read plugin masters");
        self.masters.lock().insert(key, masters.clone());
        Ok(masters)
    }

    /// Drops the file index so the next lookup sees newly installed plugins.
    fn invalidate(&self) {
        *self.index.lock() = None;
        self.masters.lock().clear();
    }
}

fn build_plugin_index(roots: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_plugin_file(name) {
                continue;
            }
            index
                .entry(name.to_lowercase())
                .or_insert_with(|| entry.path().to_path_buf());
        }
    }
    debug!(plugins = index.len(), "indexed plugin files");
    index
}

#[cfg(test)]
pub(crate) fn plugin_bytes(masters: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"HEDR");
    body.extend_from_slice(&12u16.to_le_bytes());
    body.extend_from_slice(&[0u8; 12]);
    for master in masters {
        let mut name = master.as_bytes().to_vec();
        name.push(0);
        body.extend_from_slice(b"MAST");
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&name);
        body.extend_from_slice(b"DATA");
        body.extend_from_slice(&8u16.to_le_bytes());
        body.extend_from_slice(&[0u8; 8]);
    }
    let mut out = Vec::new();
    out.extend_from_slice(b"TES4");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&body);
    out.extend_from_slice(b"GRUP");
    out.extend_from_slice(&[0u8; 20]);
    out
}
