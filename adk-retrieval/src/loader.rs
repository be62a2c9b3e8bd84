//! Reading source documents from disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{RagError, Result};

/// File extensions read by [`load_documents`].
pub const TEXT_FORMATS: &[&str] = &[
    "txt", "md", "rst", "json", "jsonl", "csv", "tsv", "yaml", "yml", "toml", "html", "htm", "xml",
    "log", "py", "rs", "js", "ts", "go", "java", "c", "cpp", "h", "sh", "sql",
];

/// The text of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    /// Path relative to the loaded root (the file name when a single file
    /// was loaded).
    pub title: String,
    pub path: PathBuf,
    pub text: String,
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEXT_FORMATS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn read(path: &Path, title: String) -> Option<SourceText> {
    match fs::read_to_string(path) {
        Ok(text) => Some(SourceText { title, path: path.to_path_buf(), text }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable file");
            None
        }
    }
}

/// Load a single file, or every supported file under a directory.
///
/// Directories are walked recursively unless `recursive` is false, in which
/// case only their direct children are read. Results are sorted by path.
/// Unreadable or non-UTF-8 files are skipped with a warning.
///
/// # Errors
///
/// Returns [`RagError::NotFound`] if `path` does not exist and
/// [`RagError::Io`] if it cannot be inspected.
pub fn load_documents(path: impl AsRef<Path>, recursive: bool) -> Result<Vec<SourceText>> {
    let root = path.as_ref();
    let metadata = fs::metadata(root).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => {
            RagError::NotFound(format!("docs path {} does not exist", root.display()))
        }
        _ => RagError::Io { path: root.to_path_buf(), source },
    })?;

    if metadata.is_file() {
        let title = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        return Ok(read(root, title).into_iter().collect());
    }

    let mut walker = WalkDir::new(root);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut files = walker
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_supported(entry.path()))
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    files.sort();

    let sources: Vec<SourceText> = files
        .iter()
        .filter_map(|file| {
            let title = file.strip_prefix(root).unwrap_or(file).to_string_lossy().replace('\\', "/");
            read(file, title)
        })
        .collect();
    debug!(root = %root.display(), files = sources.len(), recursive, "loaded documents");
    Ok(sources)
}
