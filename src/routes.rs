//! Static route table and on-disk asset serving
//!
//! The route table maps fixed paths to files and is read-only after start-up.
//! Static mounts serve whole directories below a URL prefix; the static
//! directory itself is mounted at `/`.

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Fixed route table, relative to the static directory
pub const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("/app", "index.html"),
    ("/portal", "loader.html"),
    ("/apps", "apps.html"),
    ("/gms", "gms.html"),
    ("/lessons", "agloader.html"),
    ("/info", "info.html"),
    ("/edu", "loading.html"),
];

/// Page served for every unmatched request
pub const NOT_FOUND_FILE: &str = "404.html";

const BUILTIN_NOT_FOUND: &str = "<!DOCTYPE html><title>404</title><h1>404 Not Found</h1>";

const DIRECTORY_INDEX: &str = "index.html";

/// A fixed path served from one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub path: String,
    pub file: PathBuf,
}

impl RouteEntry {
    pub fn new(path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: file.into(),
        }
    }
}

/// Exact-match lookup from request path to route entry
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: HashMap<String, RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
        }
    }

    /// The fixed table with files resolved against `static_dir`
    pub fn with_defaults(static_dir: &Path) -> Self {
        Self::new(
            DEFAULT_ROUTES
                .iter()
                .map(|(path, file)| RouteEntry::new(*path, static_dir.join(file))),
        )
    }

    pub fn lookup(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose backing file does not exist
    pub fn missing_files(&self) -> Vec<&RouteEntry> {
        let mut missing: Vec<_> = self
            .entries
            .values()
            .filter(|entry| !entry.file.is_file())
            .collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        missing
    }
}

/// A directory served below a URL prefix
#[derive(Debug, Clone)]
pub struct StaticMount {
    prefix: String,
    base_dir: PathBuf,
}

impl StaticMount {
    /// Mount `base_dir` at `prefix`; the prefix is normalised to end with `/`
    pub fn new(prefix: &str, base_dir: impl Into<PathBuf>) -> Self {
        let mut prefix = format!("/{}", prefix.trim_matches('/'));
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            prefix,
            base_dir: base_dir.into(),
        }
    }

    /// Parse a `PREFIX=DIR` mount argument
    pub fn parse(arg: &str) -> Result<Self, String> {
        let (prefix, dir) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected PREFIX=DIR, got '{}'", arg))?;
        if dir.is_empty() {
            return Err(format!("empty directory in mount '{}'", arg));
        }
        Ok(Self::new(prefix, dir))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Map a request path onto a file below the mount
    ///
    /// The path is percent-decoded before its components are checked, so an
    /// encoded `..` is refused like a literal one. Hidden files and
    /// directories are never mapped.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let rest = url_path.strip_prefix(&self.prefix)?;
        let rest = percent_decode_str(rest).decode_utf8().ok()?;

        let mut path = self.base_dir.clone();
        for component in Path::new(rest.as_ref()).components() {
            match component {
                Component::Normal(segment) if is_hidden(segment) => return None,
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }

    /// Load whatever `url_path` names below the mount, `Ok(None)` when nothing
    pub async fn load(&self, url_path: &str) -> io::Result<Option<StaticAsset>> {
        // The mount root asked for without its trailing slash
        if self.prefix.strip_suffix('/') == Some(url_path) {
            let is_dir = tokio::fs::metadata(&self.base_dir)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            return Ok(is_dir.then(|| StaticAsset::Redirect(self.prefix.clone())));
        }

        let Some(mut path) = self.map_path(url_path) else {
            return Ok(None);
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                if !url_path.ends_with('/') {
                    return Ok(Some(StaticAsset::Redirect(format!("{}/", url_path))));
                }
                path.push(DIRECTORY_INDEX);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(StaticAsset::File {
                body: Bytes::from(bytes),
                content_type: content_type(&path),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// What a static mount found for a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticAsset {
    File {
        body: Bytes,
        content_type: &'static str,
    },
    /// A directory asked for without its trailing slash; the target path
    Redirect(String),
}

fn is_hidden(segment: &OsStr) -> bool {
    segment.to_string_lossy().starts_with('.')
}

/// Content type derived from the file extension
pub fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" | "cjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "wasm" => "application/wasm",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Read the not-found page once at start-up
pub fn load_not_found_page(static_dir: &Path) -> Bytes {
    let path = static_dir.join(NOT_FOUND_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Not-found page unavailable, using built-in body");
            Bytes::from_static(BUILTIN_NOT_FOUND.as_bytes())
        }
    }
}
