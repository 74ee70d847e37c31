//! Turning command-line sources into request keys.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use walkdir::{DirEntry, WalkDir};

use crate::events::{RequestKey, SourceKind};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// One thing to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub key: RequestKey,
    pub kind: SourceKind,
}

/// Return `true` if `path` has an extension the decoder handles.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|e| *e == ext)
        })
}

/// Expand URLs, image files and directories into sources, in argument order.
///
/// Directories are walked recursively, skipping hidden subdirectories; files inside them
/// are sorted by path. Every missing local path is reported in one error.
pub fn expand(args: &[String]) -> Result<Vec<Source>> {
    let missing: Vec<&str> = args
        .iter()
        .filter(|arg| SourceKind::infer(arg) == SourceKind::Local && !Path::new(arg).exists())
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        bail!("no such file or directory: {}", missing.join(", "));
    }

    let mut out = Vec::new();
    for arg in args {
        if SourceKind::infer(arg) == SourceKind::Remote {
            out.push(Source {
                key: RequestKey::from(arg),
                kind: SourceKind::Remote,
            });
            continue;
        }

        let path = Path::new(arg);
        if path.is_dir() {
            out.extend(scan_dir(path).into_iter().map(local));
        } else {
            out.push(local(path.to_path_buf()));
        }
    }
    Ok(out)
}

fn local(path: PathBuf) -> Source {
    Source {
        key: RequestKey::new(path.to_string_lossy().into_owned()),
        kind: SourceKind::Local,
    }
}

fn scan_dir(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e))
        .flatten()
        .filter(|e| e.file_type().is_file() && is_supported_image(e.path()))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    // The root itself may be a dot-dir.
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with('.'))
}
