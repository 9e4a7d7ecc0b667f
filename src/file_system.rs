use crate::models::{FileContent, NodeKind, TreeNode};
use log::{debug, warn};
use path_clean::PathClean;
use std::fs::{self, DirEntry};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs as tokio_fs;

/// Directory that never appears in a snapshot, wherever it sits.
const EXCLUDED_DIR: &str = "node_modules";

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub fn validate_path(requested_path: &str) -> Result<PathBuf, String> {
    let base_path = PathBuf::from(requested_path);
    if !base_path.is_dir() {
        return Err(format!("Not a directory: {}", requested_path));
    }
    base_path
        .canonicalize()
        .map_err(|e| format!("Failed to canonicalize path: {}", e))
}

/// Dotfiles are hidden, except names with an `.html` extension which have
/// always been listed.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && extension_of(name).as_deref() != Some("html")
}

fn is_excluded(name: &str) -> bool {
    name == EXCLUDED_DIR || is_hidden(name)
}

/// True when every segment of a root-relative path would appear in a snapshot.
pub fn is_visible(relative: &str) -> bool {
    relative.split('/').all(|part| !is_excluded(part))
}

pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Converts an absolute path under `root` into the `/`-separated form used on
/// the wire. Returns `None` for paths outside the root and for the root itself.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Scans `root` depth-first and returns its snapshot. Unreadable entries are
/// left out of their parent rather than failing the scan.
pub fn build_tree(root: &Path) -> TreeNode {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    TreeNode {
        name,
        kind: NodeKind::Directory,
        relative_path: String::new(),
        extension: None,
        size_bytes: None,
        children: scan_dir(root, ""),
    }
}

fn scan_dir(path: &Path, rel: &str) -> Vec<TreeNode> {
    debug!("Scanning directory: {}", path.display());
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping unreadable directory '{}': {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut children: Vec<TreeNode> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => scan_entry(&entry, rel),
            Err(e) => {
                debug!("Skipping unreadable entry in '{}': {}", path.display(), e);
                None
            }
        })
        .collect();

    children.sort_by(|a, b| {
        if a.is_dir() != b.is_dir() {
            return b.is_dir().cmp(&a.is_dir());
        }
        a.name.cmp(&b.name)
    });
    children
}

fn scan_entry(entry: &DirEntry, parent_rel: &str) -> Option<TreeNode> {
    let name = entry.file_name().to_string_lossy().to_string();
    if is_excluded(&name) {
        return None;
    }
    let path = entry.path();
    let file_type = match entry.file_type() {
        Ok(ft) => ft,
        Err(e) => {
            debug!("Skipping '{}': {}", path.display(), e);
            return None;
        }
    };
    // Symlinks are listed by their target's kind but never descended into.
    let metadata = match fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => {
            debug!("Skipping '{}': {}", path.display(), e);
            return None;
        }
    };
    let relative_path = join_relative(parent_rel, &name);

    if metadata.is_dir() {
        let children = if file_type.is_symlink() {
            Vec::new()
        } else {
            scan_dir(&path, &relative_path)
        };
        Some(TreeNode {
            name,
            kind: NodeKind::Directory,
            relative_path,
            extension: None,
            size_bytes: None,
            children,
        })
    } else {
        Some(TreeNode {
            extension: extension_of(&name),
            name,
            kind: NodeKind::File,
            relative_path,
            size_bytes: Some(metadata.len()),
            children: Vec::new(),
        })
    }
}

/// Request-layer policy for `readFile`: the path must be relative, stay under
/// the root, contain no hidden segment and carry an allowed extension.
pub fn check_access(relative: &str, allowed_extensions: &[String]) -> Result<(), FileError> {
    let path = Path::new(relative);
    if relative.is_empty() || path.is_absolute() {
        return Err(FileError::AccessDenied(relative.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if is_excluded(&part) {
                    return Err(FileError::AccessDenied(relative.to_string()));
                }
            }
            Component::CurDir => {}
            _ => return Err(FileError::AccessDenied(relative.to_string())),
        }
    }
    let allowed = extension_of(relative)
        .map(|ext| allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
        .unwrap_or(false);
    if !allowed {
        return Err(FileError::AccessDenied(relative.to_string()));
    }
    Ok(())
}

/// Reads a root-relative file as text.
pub async fn read_file(root: &Path, relative: &str) -> Result<FileContent, FileError> {
    let full_path = root.join(relative).clean();
    if !full_path.starts_with(root) {
        return Err(FileError::AccessDenied(relative.to_string()));
    }
    debug!("Reading file: {}", full_path.display());
    match tokio_fs::read_to_string(&full_path).await {
        Ok(content) => Ok(FileContent {
            content,
            extension: extension_of(relative),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(FileError::NotFound(relative.to_string())),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(FileError::AccessDenied(relative.to_string()))
        }
        Err(e) => Err(FileError::Io {
            path: relative.to_string(),
            source: e,
        }),
    }
}
