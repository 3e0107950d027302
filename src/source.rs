//! Where documents come from.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use ragdex_core::{Error, Metadata, MetadataValue, Result};

/// One source document before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A finite corpus of documents.
pub trait DocumentSource: Send + Sync {
    fn documents(&self) -> Result<Vec<Document>>;
}

impl DocumentSource for Vec<Document> {
    fn documents(&self) -> Result<Vec<Document>> {
        Ok(self.clone())
    }
}

pub const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

/// Text files under a directory, recursively, in path order. Ids are paths
/// relative to the root with `/` separators.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| {
                let e: String = e.into();
                e.trim_start_matches('.').to_lowercase()
            })
            .collect();
        self
    }

    fn accepts(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        self.extensions.contains(&ext).then_some(ext)
    }
}

impl DocumentSource for DirectorySource {
    fn documents(&self) -> Result<Vec<Document>> {
        if !self.root.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "data directory {} does not exist",
                self.root.display()
            )));
        }

        let mut docs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
            {
                continue;
            }
            let Some(extension) = self.accepts(path) else {
                continue;
            };

            let bytes = std::fs::read(path)?;
            let size = bytes.len();
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(path = %path.display(), "skipping file that is not UTF-8");
                    continue;
                }
            };

            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| id.clone());

            docs.push(
                Document::new(id, text)
                    .with_metadata("file_name", file_name)
                    .with_metadata("file_path", path.to_string_lossy().to_string())
                    .with_metadata("file_size", size as i64)
                    .with_metadata("extension", extension),
            );
        }

        tracing::info!(root = %self.root.display(), documents = docs.len(), "loaded documents");
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("pdfData"));
        assert!(matches!(source.documents(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_loads_text_files_recursively() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("b.md"), "# Beta").unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("nested/c.TXT"), "gamma").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 159, 146, 150]).unwrap();
        std::fs::write(dir.path().join(".hidden/d.txt"), "secret").unwrap();
        std::fs::write(dir.path().join("bad.txt"), [0xffu8, 0xfe]).unwrap();

        let docs = DirectorySource::new(dir.path()).documents().unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.md", "nested/c.TXT"]);

        let a = &docs[0];
        assert_eq!(a.text, "alpha");
        assert_eq!(a.metadata.get("file_size"), Some(&MetadataValue::Int(5)));
        assert_eq!(
            a.metadata.get("extension"),
            Some(&MetadataValue::Text("txt".into()))
        );
        assert_eq!(
            docs[2].metadata.get("file_name"),
            Some(&MetadataValue::Text("c.TXT".into()))
        );
    }

    #[test]
    fn test_custom_extensions() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.rst"), "beta").unwrap();
        let docs = DirectorySource::new(dir.path())
            .with_extensions([".rst"])
            .documents()
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "b.rst");
    }
}
