//! Marker catalog: every marker the instrumentation planted in the sources.
//!
//! Instrumented sources carry their markers as string literals
//! (`fprintf(stderr, "[count.c] enter main 14\n")`), so the same line scanner
//! used for traces finds them statically.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::marker::{MarkerId, Signature};
use crate::parse::scan_line;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read source directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The known universe of markers for one instrumented project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerCatalog {
    markers: BTreeSet<MarkerId>,
    files_scanned: usize,
}

impl MarkerCatalog {
    /// Walk `dir` recursively and collect every marker mentioned in a text file.
    ///
    /// Files that are not UTF-8 (objects, binaries) are skipped. Hidden
    /// entries are not descended into.
    pub fn scan(dir: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current).map_err(|source| CatalogError::Io {
                path: current.clone(),
                source,
            })?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            paths.sort();

            for path in paths {
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if hidden {
                    continue;
                }
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        catalog.files_scanned += 1;
                        for line in text.lines() {
                            catalog.markers.extend(scan_line(line));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                        debug!(path = %path.display(), "skipping non-text file");
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "cannot read source file");
                    }
                }
            }
        }

        debug!(
            markers = catalog.markers.len(),
            files = catalog.files_scanned,
            "marker catalog scanned"
        );
        Ok(catalog)
    }

    pub fn from_markers(markers: impl IntoIterator<Item = MarkerId>) -> Self {
        Self {
            markers: markers.into_iter().collect(),
            files_scanned: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn files_scanned(&self) -> usize {
        self.files_scanned
    }

    pub fn contains(&self, marker: &MarkerId) -> bool {
        self.markers.contains(marker)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerId> {
        self.markers.iter()
    }

    /// Cataloged `enter` markers not yet in `seen`, in catalog order.
    pub fn missing<'a>(&'a self, seen: &'a BTreeSet<MarkerId>) -> impl Iterator<Item = &'a MarkerId> + 'a {
        self.markers
            .iter()
            .filter(move |m| m.is_enter() && !seen.contains(*m))
    }

    /// Number of cataloged markers present in `seen`.
    pub fn covered_by(&self, seen: &BTreeSet<MarkerId>) -> usize {
        self.markers.intersection(seen).count()
    }

    pub fn covered_by_signature(&self, signature: &Signature) -> usize {
        self.covered_by(signature.as_set())
    }
}
