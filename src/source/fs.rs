use super::{DocumentSource, DocumentStat};
use crate::error::{Result, WeftError};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Markdown notes under a directory
///
/// Hidden directories (`.git`, `.weft`, editor state) are skipped.
pub struct FsDocumentSource {
    root: PathBuf,
    extension: String,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(WeftError::Source(format!(
                "Corpus root is not a directory: {:?}",
                root
            )));
        }
        Ok(Self {
            root,
            extension: "md".to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(WeftError::Source(format!(
                "Path escapes the corpus root: {}",
                path
            )));
        }
        Ok(self.root.join(path))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to read directory: {:?}", dir),
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden {
                continue;
            }

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };

            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if file_type.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
            {
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let parts: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.push(parts.join("/"));
                }
            }
        }
        Ok(())
    }
}

impl DocumentSource for FsDocumentSource {
    fn list(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        self.walk(&self.root, &mut paths)?;
        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        match std::fs::read_to_string(&full) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WeftError::DocumentNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(WeftError::Io {
                source: e,
                context: format!("Failed to read document: {:?}", full),
            }),
        }
    }

    fn stat(&self, path: &str) -> Result<Option<DocumentStat>> {
        let full = self.resolve(path)?;
        let metadata = match std::fs::metadata(&full) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WeftError::Io {
                    source: e,
                    context: format!("Failed to stat document: {:?}", full),
                })
            }
        };

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(Some(DocumentStat {
            size: metadata.len(),
            mtime,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use tempfile::TempDir;

    fn vault() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("Topics")).unwrap();
        std::fs::create_dir_all(root.join(".weft")).unwrap();
        std::fs::write(root.join("a.md"), "Links to [[Topics/T]]").unwrap();
        std::fs::write(root.join("Topics/T.md"), "# Topic").unwrap();
        std::fs::write(root.join("notes.txt"), "not markdown").unwrap();
        std::fs::write(root.join(".weft/hidden.md"), "ignored").unwrap();
        temp
    }

    #[test]
    fn test_list_skips_hidden_and_foreign_files() {
        let temp = vault();
        let source = FsDocumentSource::new(temp.path()).unwrap();
        assert_eq!(source.list().unwrap(), vec!["Topics/T.md", "a.md"]);
    }

    #[test]
    fn test_read_stat_links() {
        let temp = vault();
        let source = FsDocumentSource::new(temp.path()).unwrap();

        assert_eq!(source.read("Topics/T.md").unwrap(), "# Topic");
        let stat = source.stat("a.md").unwrap().unwrap();
        assert_eq!(stat.size, "Links to [[Topics/T]]".len() as u64);
        assert!(source.stat("missing.md").unwrap().is_none());

        let links = source.links("a.md").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "Topics/T");
        assert_eq!(links[0].kind, EdgeKind::Body);
    }

    #[test]
    fn test_missing_document_and_escape() {
        let temp = vault();
        let source = FsDocumentSource::new(temp.path()).unwrap();
        assert!(matches!(
            source.read("gone.md"),
            Err(WeftError::DocumentNotFound { .. })
        ));
        assert!(source.read("../outside.md").is_err());
    }
}
