//! Kernel source loading.

use crate::error::{ClError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::thread;

/// Called with the loaded text, or `None` when the load failed.
pub type LoadCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

pub trait SourceLoader: Send + Sync {
    /// Loads `uri` synchronously.
    fn load(&self, uri: &str) -> Result<String>;

    /// Starts loading `uri` in the background and returns at once.
    ///
    /// An invalid URI fails immediately; a failed load is reported by
    /// calling back with `None`.
    fn load_async(&self, uri: &str, callback: LoadCallback) -> Result<()>;
}

/// Accepts only non-empty URIs with a `.cl` suffix.
pub fn validate_uri(uri: &str) -> Result<()> {
    if uri.len() > 3 && uri.ends_with(".cl") {
        Ok(())
    } else {
        Err(ClError::expecting("a URI ending in '.cl'"))
    }
}

/// Resolves URIs as paths relative to a root directory. Absolute URIs and
/// `..` components are refused.
#[derive(Debug, Clone)]
pub struct FileSourceLoader {
    root: PathBuf,
}

impl FileSourceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        validate_uri(uri)?;
        let relative = Path::new(uri);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(ClError::expecting("a URI relative to the source root"));
        }
        Ok(self.root.join(relative))
    }
}

impl Default for FileSourceLoader {
    fn default() -> Self {
        Self::new(".")
    }
}

fn read_source(path: &Path, uri: &str) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ClError::SourceLoad { uri: uri.to_owned(), reason: e.to_string() })?;
    if text.trim().is_empty() {
        return Err(ClError::SourceLoad { uri: uri.to_owned(), reason: "file is empty".into() });
    }
    Ok(text)
}

impl SourceLoader for FileSourceLoader {
    fn load(&self, uri: &str) -> Result<String> {
        let text = read_source(&self.resolve(uri)?, uri)?;
        tracing::debug!(uri, bytes = text.len(), "loaded kernel source");
        Ok(text)
    }

    fn load_async(&self, uri: &str, callback: LoadCallback) -> Result<()> {
        let path = self.resolve(uri)?;
        let uri = uri.to_owned();
        thread::spawn(move || match read_source(&path, &uri) {
            Ok(text) => callback(Some(text)),
            Err(e) => {
                tracing::warn!("{e}");
                callback(None);
            }
        });
        Ok(())
    }
}

/// Serves sources from memory, keyed by URI.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceLoader {
    files: HashMap<String, String>,
}

impl MemorySourceLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, uri: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(uri.into(), source.into());
        self
    }
}

impl SourceLoader for MemorySourceLoader {
    fn load(&self, uri: &str) -> Result<String> {
        validate_uri(uri)?;
        self.files
            .get(uri)
            .cloned()
            .ok_or_else(|| ClError::SourceLoad { uri: uri.to_owned(), reason: "not found".into() })
    }

    fn load_async(&self, uri: &str, callback: LoadCallback) -> Result<()> {
        validate_uri(uri)?;
        let found = self.files.get(uri).cloned();
        thread::spawn(move || callback(found));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn loader() -> MemorySourceLoader {
        MemorySourceLoader::new().with_file("kernels/rng.cl", "__kernel void rnd(__global uint* out) {}")
    }

    #[test]
    fn rejects_invalid_uris_immediately() {
        for uri in ["", ".cl", "invalidURI", "kernel.clx"] {
            assert!(matches!(loader().load(uri), Err(ClError::InvalidArguments(_))), "{uri}");
            assert!(loader().load_async(uri, Box::new(|_| {})).is_err(), "{uri}");
        }
    }

    #[test]
    fn missing_file_fails_synchronously() {
        assert!(matches!(
            loader().load("validButDoesNotExist.cl"),
            Err(ClError::SourceLoad { .. })
        ));
        let files = FileSourceLoader::new(std::env::temp_dir());
        assert!(files.load("clkit-validButDoesNotExist.cl").is_err());
    }

    #[test]
    fn async_load_calls_back() {
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        loader()
            .load_async("kernels/rng.cl", Box::new(move |src| tx.send(src).unwrap()))
            .unwrap();
        let src = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(src.unwrap().contains("rnd"));

        loader()
            .load_async("validButDoesNotExist.cl", Box::new(move |src| tx2.send(src).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    }

    #[test]
    fn file_loader_reads_relative_to_root() {
        let dir = std::env::temp_dir().join(format!("clkit-source-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("copy.cl"), "__kernel void copy() {}").unwrap();
        let files = FileSourceLoader::new(&dir);
        assert!(files.load("copy.cl").unwrap().contains("copy"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_loader_stays_inside_its_root() {
        let files = FileSourceLoader::new(std::env::temp_dir());
        for uri in ["/etc/kernel.cl", "../kernel.cl", "kernels/../../kernel.cl"] {
            assert!(matches!(files.load(uri), Err(ClError::InvalidArguments(_))), "{uri}");
            assert!(
                matches!(files.load_async(uri, Box::new(|_| {})), Err(ClError::InvalidArguments(_))),
                "{uri}"
            );
        }
    }
}
