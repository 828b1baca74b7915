//! Folder-tree mapping for the company document repositories.
//!
//! Produces a nested structure with per-file metadata and SHA-256 checksums
//! that the shell uses to browse submodules and the pipeline uses to resolve
//! a logical submodule label to a filesystem path. A label that cannot be
//! resolved is a `None`, never an error — missing folders are a normal state
//! while a company drive is being organized.

use crate::errors::{ProcessError, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified: Option<u64>,
    pub extension: String,
    /// SHA-256 of the file contents; `None` when the file vanished or could
    /// not be read while scanning.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirNode {
    pub name: String,
    pub path: String,
    pub files: Vec<FileEntry>,
    pub subdirectories: BTreeMap<String, DirNode>,
    pub file_count: usize,
    pub dir_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMap {
    pub root: String,
    pub scan_date: String,
    pub total_files: usize,
    pub total_folders: usize,
    pub structure: DirNode,
}

/// Map a directory tree. Fails only when the root itself does not exist;
/// unreadable children are recorded in their node's `errors` and skipped.
pub fn map_directory(root: &Path) -> Result<DirectoryMap> {
    if !root.exists() {
        return Err(ProcessError::FileNotFound {
            path: root.to_path_buf(),
        });
    }
    let structure = map_recursive(root);
    let total_files = count_files(&structure);
    let total_folders = count_folders(&structure);
    info!(root = %root.display(), total_files, total_folders, "directory mapped");
    Ok(DirectoryMap {
        root: root.display().to_string(),
        scan_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        total_files,
        total_folders,
        structure,
    })
}

fn map_recursive(dir: &Path) -> DirNode {
    let mut node = DirNode {
        name: clean_name(&dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()),
        path: dir.display().to_string(),
        files: Vec::new(),
        subdirectories: BTreeMap::new(),
        file_count: 0,
        dir_count: 0,
        errors: Vec::new(),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "could not read directory");
            node.errors.push(format!("could not read {}: {e}", dir.display()));
            return node;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                node.errors.push(e.to_string());
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            let child = map_recursive(&path);
            node.subdirectories.insert(child.name.clone(), child);
        } else if path.is_file() {
            match file_entry(&path) {
                Ok(file) => node.files.push(file),
                Err(e) => node.errors.push(format!("could not stat {}: {e}", path.display())),
            }
        }
    }
    node.files.sort_by(|a, b| a.name.cmp(&b.name));
    node.file_count = node.files.len();
    node.dir_count = node.subdirectories.len();
    node
}

fn file_entry(path: &Path) -> std::io::Result<FileEntry> {
    let metadata = path.metadata()?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    Ok(FileEntry {
        name: clean_name(&path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()),
        path: path.display().to_string(),
        size: metadata.len(),
        modified,
        extension: path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default(),
        checksum: sha256_file(path).ok(),
    })
}

/// Streamed SHA-256 in 4K blocks so large scans stay flat in memory.
fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Names come from mixed sources (Windows shares, Drive sync); normalize so
/// the same folder always keys identically.
fn clean_name(name: &str) -> String {
    name.nfc().collect()
}

fn fold_key(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

fn count_files(node: &DirNode) -> usize {
    node.files.len() + node.subdirectories.values().map(count_files).sum::<usize>()
}

fn count_folders(node: &DirNode) -> usize {
    node.subdirectories.len() + node.subdirectories.values().map(count_folders).sum::<usize>()
}

impl DirectoryMap {
    /// Lookup of a submodule folder by label, case- and
    /// normalization-insensitive. `None` when the label does not exist.
    pub fn resolve(&self, label: &str) -> Option<&DirNode> {
        let wanted = fold_key(label);
        let mut queue: Vec<&DirNode> = vec![&self.structure];
        while let Some(node) = queue.pop() {
            for child in node.subdirectories.values() {
                if fold_key(&child.name) == wanted {
                    return Some(child);
                }
                queue.push(child);
            }
        }
        None
    }

    pub fn resolve_path(&self, label: &str) -> Option<PathBuf> {
        self.resolve(label).map(|node| PathBuf::from(&node.path))
    }

    pub fn save_cache(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ProcessError::config(format!("could not serialize directory map: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_cache(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProcessError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| ProcessError::config(format!("invalid directory map cache: {e}")))
    }
}
