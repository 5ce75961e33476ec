//! Durable gallery of confirmed identities.
//!
//! Layout under the data directory:
//!
//! ```text
//! face_data.json          catalog: [{id, name, description, image_path, encoding_path}]
//! Alice/Alice.jpg         representative photo
//! Alice/Alice.json        serialized embedding
//! ```
//!
//! Catalog paths are stored relative to the data directory. Embeddings are
//! never written into the catalog; they are read from `encoding_path` the
//! first time an identity takes part in matching.

use crate::analyzer::{encode_image, AnalyzerError, FaceAnalyzer, Portrait};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CATALOG_FILE: &str = "face_data.json";
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const ENCODING_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog: {0}")]
    Catalog(#[from] serde_json::Error),
    #[error("image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("no face found in {0}")]
    NoFace(PathBuf),
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("identity ids exhausted")]
    IdsExhausted,
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// In-memory state of an identity's embedding.
#[derive(Debug, Clone, Default)]
enum EncodingCache {
    /// Not read from disk yet.
    #[default]
    Pending,
    Ready(Embedding),
    /// Reading failed once; the identity does not take part in matching.
    Unavailable,
}

/// A confirmed, named, persisted identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_path: PathBuf,
    #[serde(default)]
    pub encoding_path: PathBuf,
    #[serde(skip)]
    encoding: EncodingCache,
}

impl Identity {
    /// Cached embedding, loading it from `root`/`encoding_path` on first use.
    pub fn encoding(&mut self, root: &Path) -> Option<&Embedding> {
        if matches!(self.encoding, EncodingCache::Pending) {
            let path = root.join(&self.encoding_path);
            self.encoding = match read_embedding(&path) {
                Ok(embedding) => EncodingCache::Ready(embedding),
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "embedding unavailable, identity will not match");
                    EncodingCache::Unavailable
                }
            };
        }
        self.cached_encoding()
    }

    /// Embedding if it has already been loaded.
    pub fn cached_encoding(&self) -> Option<&Embedding> {
        match &self.encoding {
            EncodingCache::Ready(embedding) => Some(embedding),
            _ => None,
        }
    }

    /// Whether two identities carry the same catalog record.
    pub fn same_record(&self, other: &Identity) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.image_path == other.image_path
            && self.encoding_path == other.encoding_path
    }
}

/// Outcome of a storage scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Names of identities added to the catalog.
    pub added: Vec<String>,
    /// Embedding artifacts computed from images.
    pub encoded: usize,
    /// Entries skipped because of an error or a face-less image.
    pub skipped: usize,
}

/// Reject names that cannot be used as a folder key.
pub fn validate_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed == CATALOG_FILE
    {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

pub struct IdentityStore {
    root: PathBuf,
    identities: Vec<Identity>,
}

impl IdentityStore {
    /// Open the store at `root`, creating the directory and reading the catalog.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io(&root))?;
        let identities = load_catalog(&root.join(CATALOG_FILE))?;
        tracing::info!(root = %root.display(), count = identities.len(), "identity catalog loaded");
        Ok(Self { root, identities })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    /// Identities in catalog order.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.name == name)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// `max(existing id) + 1`, or 1 for an empty store.
    pub fn next_id(&self) -> Result<u32, StoreError> {
        match self.identities.iter().map(|i| i.id).max() {
            Some(max) => max.checked_add(1).ok_or(StoreError::IdsExhausted),
            None => Ok(1),
        }
    }

    fn position(&self, name: &str) -> Result<usize, StoreError> {
        self.identities
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root).unwrap_or(path).to_path_buf()
    }

    fn is_taken(&self, name: &str) -> bool {
        self.identities.iter().any(|i| i.name == name) || self.root.join(name).exists()
    }

    /// `desired` if neither an identity nor a folder uses it, otherwise the
    /// first free `desired_N` with `N >= 2`.
    pub fn allocate_name(&self, desired: &str) -> String {
        if !self.is_taken(desired) {
            return desired.to_string();
        }
        (2u32..)
            .map(|n| format!("{desired}_{n}"))
            .find(|candidate| !self.is_taken(candidate))
            .unwrap_or_else(|| desired.to_string())
    }

    /// First identity, in catalog order, within `tolerance` of `candidate`.
    pub fn find_match(&mut self, candidate: &Embedding, tolerance: f32) -> Option<&Identity> {
        let root = &self.root;
        for identity in self.identities.iter_mut() {
            identity.encoding(root);
        }

        let references = self
            .identities
            .iter()
            .enumerate()
            .filter_map(|(idx, identity)| identity.cached_encoding().map(|e| (idx, e)));
        let found = EuclideanMatcher.first_match(candidate, references, tolerance)?;
        self.identities.get(found.key)
    }

    /// Append `identity` under `next_id()`, ignoring whatever id it carries.
    pub fn insert(&mut self, mut identity: Identity) -> Result<&Identity, StoreError> {
        identity.id = self.next_id()?;
        let pos = self.identities.len();
        self.identities.push(identity);
        Ok(&self.identities[pos])
    }

    /// Replace the identity with the same id, or append it under a fresh id.
    pub fn upsert(&mut self, identity: Identity) -> Result<&Identity, StoreError> {
        match self.identities.iter().position(|i| i.id == identity.id) {
            Some(pos) => {
                self.identities[pos] = identity;
                Ok(&self.identities[pos])
            }
            None => self.insert(identity),
        }
    }

    /// Persist a portrait as a new identity. A taken name is disambiguated.
    pub fn create(&mut self, name: &str, description: &str, portrait: &Portrait) -> Result<Identity, StoreError> {
        let name = self.allocate_name(validate_name(name)?);
        self.next_id()?;
        let (image_path, encoding_path) = match self.write_portrait(&name, portrait) {
            Ok(paths) => paths,
            Err(e) => {
                let _ = fs::remove_dir_all(self.root.join(&name));
                return Err(e);
            }
        };

        let identity = Identity {
            id: 0,
            name,
            description: description.to_string(),
            image_path,
            encoding_path,
            encoding: EncodingCache::Ready(portrait.embedding.clone()),
        };
        let identity = self.insert(identity)?.clone();
        tracing::info!(id = identity.id, name = %identity.name, "identity created");
        Ok(identity)
    }

    /// Write `<folder>/<folder>.jpg` and `<folder>/<folder>.json`, returning
    /// their catalog paths.
    fn write_portrait(&self, folder_name: &str, portrait: &Portrait) -> Result<(PathBuf, PathBuf), StoreError> {
        let folder_name = validate_name(folder_name)?;
        let folder = self.root.join(folder_name);
        fs::create_dir_all(&folder).map_err(io(&folder))?;

        let image_path = folder.join(format!("{folder_name}.jpg"));
        portrait.image.save(&image_path).map_err(|source| StoreError::Image {
            path: image_path.clone(),
            source,
        })?;
        let encoding_path = folder.join(format!("{folder_name}.{ENCODING_EXTENSION}"));
        write_embedding(&encoding_path, &portrait.embedding)?;

        Ok((self.relative(&image_path), self.relative(&encoding_path)))
    }

    /// Replace an identity's photo and embedding.
    pub fn replace_portrait(&mut self, name: &str, portrait: &Portrait) -> Result<(), StoreError> {
        let idx = self.position(name)?;
        let (image_path, encoding_path) = self.write_portrait(name, portrait)?;

        let stale = self.root.join(&self.identities[idx].image_path);
        if self.identities[idx].image_path != image_path && stale.is_file() {
            if let Err(e) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %e, "failed to remove replaced photo");
            }
        }

        let identity = &mut self.identities[idx];
        identity.image_path = image_path;
        identity.encoding_path = encoding_path;
        identity.encoding = EncodingCache::Ready(portrait.embedding.clone());
        tracing::info!(name, "identity photo replaced");
        Ok(())
    }

    pub fn set_description(&mut self, name: &str, description: &str) -> Result<(), StoreError> {
        let idx = self.position(name)?;
        self.identities[idx].description = description.to_string();
        Ok(())
    }

    /// Rename an identity and relocate its folder. Returns the final name.
    ///
    /// If `new_name` is held by another identity or folder, the identity is
    /// moved to a disambiguated name instead; existing storage is never
    /// overwritten.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<String, StoreError> {
        let idx = self.position(old_name)?;
        let new_name = validate_name(new_name)?;
        if new_name == old_name {
            return Ok(old_name.to_string());
        }

        let final_name = self.allocate_name(new_name);
        if final_name != new_name {
            tracing::warn!(requested = new_name, assigned = %final_name, "name already in use, relocating to a fresh folder");
        }

        let old_folder = self.root.join(old_name);
        let new_folder = self.root.join(&final_name);
        if validate_name(old_name).is_ok() && old_folder.is_dir() {
            fs::rename(&old_folder, &new_folder).map_err(io(&old_folder))?;
        } else {
            fs::create_dir_all(&new_folder).map_err(io(&new_folder))?;
        }

        let image_path = self.relocate_artifact(&self.identities[idx].image_path, &new_folder, &final_name, "jpg");
        let encoding_path =
            self.relocate_artifact(&self.identities[idx].encoding_path, &new_folder, &final_name, ENCODING_EXTENSION);

        let identity = &mut self.identities[idx];
        identity.image_path = image_path;
        identity.encoding_path = encoding_path;
        identity.name = final_name.clone();
        tracing::info!(from = old_name, to = %final_name, "identity renamed");
        Ok(final_name)
    }

    /// Move an artifact to `<folder>/<name>.<ext>` after its folder was
    /// relocated, returning its catalog path. Failures keep the old file.
    fn relocate_artifact(&self, old: &Path, folder: &Path, name: &str, default_ext: &str) -> PathBuf {
        let ext = old.extension().and_then(|e| e.to_str()).unwrap_or(default_ext);
        let target = folder.join(format!("{name}.{ext}"));

        let moved_with_folder = old.file_name().map(|f| folder.join(f));
        let source = moved_with_folder
            .into_iter()
            .chain(std::iter::once(self.root.join(old)))
            .find(|p| p.is_file());

        match source {
            Some(src) if src != target => match fs::rename(&src, &target) {
                Ok(()) => self.relative(&target),
                Err(e) => {
                    tracing::warn!(path = %src.display(), error = %e, "failed to rename artifact");
                    self.relative(&src)
                }
            },
            Some(_) => self.relative(&target),
            None => {
                tracing::warn!(path = %old.display(), "artifact missing during relocation");
                self.relative(&target)
            }
        }
    }

    /// Remove an identity and its whole folder. A missing folder is fine.
    pub fn delete(&mut self, name: &str) -> Result<Identity, StoreError> {
        let idx = self.position(name)?;
        if validate_name(name).is_ok() {
            let folder = self.root.join(name);
            match fs::remove_dir_all(&folder) {
                Ok(()) => tracing::debug!(folder = %folder.display(), "identity folder removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io(&folder)(e)),
            }
        } else {
            tracing::warn!(name, "identity name is not a folder key, leaving storage untouched");
        }
        let removed = self.identities.remove(idx);
        tracing::info!(id = removed.id, name, "identity deleted");
        Ok(removed)
    }

    /// Write the catalog. Embeddings are not included.
    pub fn persist(&self) -> Result<(), StoreError> {
        let path = self.catalog_path();
        let json = serde_json::to_string_pretty(&self.identities)?;
        fs::write(&path, json).map_err(io(&path))?;
        tracing::debug!(path = %path.display(), count = self.identities.len(), "catalog persisted");
        Ok(())
    }

    /// Pick up photos added to the data directory out of band.
    ///
    /// A loose image at the top level is encoded and, if a face is found,
    /// moved into its own folder. A folder with an image but no embedding
    /// gets one computed. Folders not in the catalog are added. Failures are
    /// logged and the entry is skipped.
    pub fn scan(&mut self, analyzer: &mut dyn FaceAnalyzer) -> ScanReport {
        let mut report = ScanReport::default();
        let mut paths = match list_entries(&self.root) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "cannot scan data directory");
                return report;
            }
        };
        paths.sort();

        for path in paths {
            if path.is_dir() {
                self.scan_folder(&path, analyzer, &mut report);
            } else if is_image(&path) {
                self.ingest_loose_image(&path, analyzer, &mut report);
            }
        }

        tracing::info!(
            added = report.added.len(),
            encoded = report.encoded,
            skipped = report.skipped,
            "storage scan finished"
        );
        report
    }

    fn scan_folder(&mut self, folder: &Path, analyzer: &mut dyn FaceAnalyzer, report: &mut ScanReport) {
        let Some(name) = folder.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            report.skipped += 1;
            return;
        };
        let files = match list_entries(folder) {
            Ok(mut files) => {
                files.sort();
                files
            }
            Err(e) => {
                tracing::warn!(folder = %folder.display(), error = %e, "cannot read identity folder");
                report.skipped += 1;
                return;
            }
        };
        let Some(image_path) = files.iter().find(|p| is_image(p)).cloned() else {
            tracing::debug!(folder = %folder.display(), "no image in folder");
            return;
        };
        let known = self.identities.iter().position(|i| i.name == name);
        let existing_encoding = files.iter().find(|p| is_encoding(p)).cloned();
        if known.is_some() && existing_encoding.is_some() {
            return;
        }

        let (encoding_path, encoding) = match existing_encoding {
            Some(path) => (path, EncodingCache::Pending),
            None => {
                let path = folder.join(format!("{name}.{ENCODING_EXTENSION}"));
                match encode_file(&image_path, analyzer).and_then(|e| write_embedding(&path, &e).map(|_| e)) {
                    Ok(embedding) => {
                        tracing::info!(image = %image_path.display(), "embedding created");
                        report.encoded += 1;
                        (path, EncodingCache::Ready(embedding))
                    }
                    Err(e) => {
                        tracing::warn!(image = %image_path.display(), error = %e, "skipping storage entry");
                        report.skipped += 1;
                        return;
                    }
                }
            }
        };

        let encoding_path = self.relative(&encoding_path);
        match known {
            Some(idx) => {
                let identity = &mut self.identities[idx];
                identity.encoding_path = encoding_path;
                identity.encoding = encoding;
            }
            None => {
                let image_path = self.relative(&image_path);
                let identity = Identity {
                    id: 0,
                    name: name.clone(),
                    description: String::new(),
                    image_path,
                    encoding_path,
                    encoding,
                };
                if let Err(e) = self.insert(identity) {
                    tracing::warn!(name = %name, error = %e, "skipping storage entry");
                    report.skipped += 1;
                    return;
                }
                tracing::info!(name = %name, "identity discovered in storage");
                report.added.push(name);
            }
        }
    }

    fn ingest_loose_image(&mut self, path: &Path, analyzer: &mut dyn FaceAnalyzer, report: &mut ScanReport) {
        let stem = match path.file_stem().and_then(|s| s.to_str()).map(validate_name) {
            Some(Ok(stem)) => stem.to_string(),
            _ => {
                tracing::warn!(image = %path.display(), "image name is not usable as an identity name");
                report.skipped += 1;
                return;
            }
        };

        let embedding = match encode_file(path, analyzer) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(image = %path.display(), error = %e, "leaving image in place");
                report.skipped += 1;
                return;
            }
        };

        let name = self.allocate_name(&stem);
        match self.adopt_image(path, &name, embedding) {
            Ok(()) => {
                tracing::info!(image = %path.display(), name = %name, "image ingested");
                report.encoded += 1;
                report.added.push(name);
            }
            Err(e) => {
                tracing::warn!(image = %path.display(), error = %e, "failed to ingest image");
                report.skipped += 1;
            }
        }
    }

    /// Move a loose image into a new `<name>/` folder and catalogue it.
    fn adopt_image(&mut self, path: &Path, name: &str, embedding: Embedding) -> Result<(), StoreError> {
        self.next_id()?;
        let folder = self.root.join(name);
        fs::create_dir_all(&folder).map_err(io(&folder))?;

        let encoding_path = folder.join(format!("{name}.{ENCODING_EXTENSION}"));
        write_embedding(&encoding_path, &embedding)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("jpg");
        let image_path = folder.join(format!("{name}.{ext}"));
        fs::rename(path, &image_path).map_err(io(path))?;

        let identity = Identity {
            id: 0,
            name: name.to_string(),
            description: String::new(),
            image_path: self.relative(&image_path),
            encoding_path: self.relative(&encoding_path),
            encoding: EncodingCache::Ready(embedding),
        };
        self.insert(identity)?;
        Ok(())
    }
}

/// Read the catalog at `path`. A missing file is an empty catalog;
/// malformed or duplicate records are skipped.
pub fn load_catalog(path: &Path) -> Result<Vec<Identity>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io(path)(e)),
    };
    let records: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;

    let mut identities: Vec<Identity> = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<Identity>(record) {
            Ok(identity) if identities.iter().any(|i| i.name == identity.name || i.id == identity.id) => {
                tracing::warn!(index, name = %identity.name, id = identity.id, "duplicate catalog record skipped");
            }
            Ok(identity) => identities.push(identity),
            Err(e) => tracing::warn!(index, error = %e, "malformed catalog record skipped"),
        }
    }
    Ok(identities)
}

fn read_embedding(path: &Path) -> Result<Embedding, StoreError> {
    let bytes = fs::read(path).map_err(io(path))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_embedding(path: &Path, embedding: &Embedding) -> Result<(), StoreError> {
    let json = serde_json::to_vec(embedding)?;
    fs::write(path, json).map_err(io(path))
}

fn encode_file(image_path: &Path, analyzer: &mut dyn FaceAnalyzer) -> Result<Embedding, StoreError> {
    let image = image::open(image_path)
        .map_err(|source| StoreError::Image {
            path: image_path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    match encode_image(analyzer, &image) {
        Ok(embedding) => Ok(embedding),
        Err(AnalyzerError::NoFaceDetected) => Err(StoreError::NoFace(image_path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

fn list_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect()
}

fn has_extension(path: &Path, accepted: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| accepted.iter().any(|a| a.eq_ignore_ascii_case(e)))
}

fn is_image(path: &Path) -> bool {
    path.is_file() && has_extension(path, &IMAGE_EXTENSIONS)
}

fn is_encoding(path: &Path) -> bool {
    path.is_file()
        && has_extension(path, &[ENCODING_EXTENSION])
        && path.file_name().and_then(|n| n.to_str()) != Some(CATALOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::PixelAnalyzer;
    use image::{Rgb, RgbImage};

    fn portrait(pixel: [u8; 3]) -> Portrait {
        Portrait {
            image: RgbImage::from_pixel(8, 8, Rgb(pixel)),
            embedding: PixelAnalyzer::embedding_for(pixel),
        }
    }

    fn write_png(path: &Path, pixel: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(pixel)).save(path).unwrap();
    }

    #[test]
    fn test_open_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(dir.path().join("face_data")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.next_id().unwrap(), 1);
        assert!(store.root().is_dir());
    }

    #[test]
    fn test_create_assigns_increasing_ids_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        let alice = store.create("Alice", "friend", &portrait([255, 0, 0])).unwrap();
        let bob = store.create("Bob", "", &portrait([0, 255, 0])).unwrap();

        assert_eq!((alice.id, bob.id), (1, 2));
        assert_eq!(alice.image_path, PathBuf::from("Alice/Alice.jpg"));
        assert!(dir.path().join("Alice/Alice.jpg").is_file());
        assert!(dir.path().join("Alice/Alice.json").is_file());
        assert_eq!(store.next_id().unwrap(), 3);
    }

    #[test]
    fn test_next_id_follows_max_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("A", "", &portrait([255, 0, 0])).unwrap();
        store.create("B", "", &portrait([0, 255, 0])).unwrap();
        store.delete("A").unwrap();
        assert_eq!(store.create("C", "", &portrait([0, 0, 255])).unwrap().id, 3);
    }

    #[test]
    fn test_persist_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "likes tea\nsecond line", &portrait([255, 0, 0])).unwrap();
        store.create("Bob", "", &portrait([0, 255, 0])).unwrap();
        store.persist().unwrap();

        let reloaded = IdentityStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        for (a, b) in store.identities().iter().zip(reloaded.identities()) {
            assert!(a.same_record(b), "{a:?} != {b:?}");
            assert!(b.cached_encoding().is_none(), "embeddings are not eagerly loaded");
        }

        let raw = fs::read_to_string(dir.path().join(CATALOG_FILE)).unwrap();
        assert!(!raw.contains("values"), "catalog must not embed raw embeddings");
    }

    #[test]
    fn test_lazy_encoding_load_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        store.persist().unwrap();

        let mut reloaded = IdentityStore::open(dir.path()).unwrap();
        let candidate = PixelAnalyzer::embedding_for([250, 0, 0]);
        let found = reloaded.find_match(&candidate, 0.5).map(|i| i.name.clone());
        assert_eq!(found.as_deref(), Some("Alice"));
        assert!(reloaded.identities()[0].cached_encoding().is_some());
    }

    #[test]
    fn test_missing_encoding_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        store.persist().unwrap();
        fs::remove_file(dir.path().join("Alice/Alice.json")).unwrap();

        let mut reloaded = IdentityStore::open(dir.path()).unwrap();
        let candidate = PixelAnalyzer::embedding_for([255, 0, 0]);
        assert!(reloaded.find_match(&candidate, 0.5).is_none());
        assert!(reloaded.find_match(&candidate, 0.5).is_none());
    }

    #[test]
    fn test_find_match_is_first_in_catalog_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("First", "", &portrait([200, 0, 0])).unwrap();
        store.create("Closer", "", &portrait([255, 0, 0])).unwrap();
        let candidate = PixelAnalyzer::embedding_for([255, 0, 0]);
        assert_eq!(store.find_match(&candidate, 0.5).unwrap().name, "First");
    }

    #[test]
    fn test_rename_relocates_folder_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();

        let final_name = store.rename("Alice", "Alicia").unwrap();
        assert_eq!(final_name, "Alicia");
        assert!(!dir.path().join("Alice").exists());
        assert!(dir.path().join("Alicia/Alicia.jpg").is_file());
        assert!(dir.path().join("Alicia/Alicia.json").is_file());
        let identity = store.get("Alicia").unwrap();
        assert_eq!(identity.encoding_path, PathBuf::from("Alicia/Alicia.json"));
        assert_eq!(identity.id, 1);
    }

    #[test]
    fn test_rename_onto_existing_storage_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        store.create("Bob", "", &portrait([0, 255, 0])).unwrap();
        let bob_before = fs::read(dir.path().join("Bob/Bob.json")).unwrap();

        let final_name = store.rename("Alice", "Bob").unwrap();
        assert_eq!(final_name, "Bob_2");
        assert_eq!(fs::read(dir.path().join("Bob/Bob.json")).unwrap(), bob_before);
        assert!(dir.path().join("Bob_2/Bob_2.json").is_file());
        assert_eq!(store.identities().iter().filter(|i| i.name == "Bob").count(), 1);
    }

    #[test]
    fn test_rename_onto_orphan_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        fs::create_dir(dir.path().join("Carol")).unwrap();
        fs::write(dir.path().join("Carol/notes.txt"), "keep me").unwrap();

        assert_eq!(store.rename("Alice", "Carol").unwrap(), "Carol_2");
        assert_eq!(fs::read_to_string(dir.path().join("Carol/notes.txt")).unwrap(), "keep me");
    }

    #[test]
    fn test_rename_unknown_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        assert!(matches!(store.rename("Ghost", "X"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_removes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        store.delete("Alice").unwrap();
        assert!(store.is_empty());
        assert!(!dir.path().join("Alice").exists());
        assert!(matches!(store.delete("Alice"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_tolerates_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        fs::remove_dir_all(dir.path().join("Alice")).unwrap();
        assert_eq!(store.delete("Alice").unwrap().name, "Alice");
    }

    #[test]
    fn test_replace_portrait_updates_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        store.replace_portrait("Alice", &portrait([0, 0, 255])).unwrap();

        let candidate = PixelAnalyzer::embedding_for([0, 0, 255]);
        assert_eq!(store.find_match(&candidate, 0.1).unwrap().name, "Alice");
        let on_disk = read_embedding(&dir.path().join("Alice/Alice.json")).unwrap();
        assert_eq!(on_disk, candidate);
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", "   ", ".", "..", "a/b", "a\\b", CATALOG_FILE] {
            assert!(validate_name(name).is_err(), "{name:?} should be rejected");
        }
        assert_eq!(validate_name("  Alice ").unwrap(), "Alice");
    }

    #[test]
    fn test_catalog_skips_malformed_and_duplicate_records() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = r#"[
            {"id": 1, "name": "Alice", "description": "", "image_path": "Alice/Alice.jpg", "encoding_path": "Alice/Alice.json"},
            {"name": "no id"},
            {"id": 2, "name": "Alice", "image_path": "", "encoding_path": ""},
            {"id": 3, "name": "Bob"}
        ]"#;
        fs::write(dir.path().join(CATALOG_FILE), catalog).unwrap();

        let store = IdentityStore::open(dir.path()).unwrap();
        let names: Vec<_> = store.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
        assert_eq!(store.next_id().unwrap(), 4);
    }

    #[test]
    fn test_create_never_replaces_record_with_id_zero() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = r#"[{"id": 0, "name": "Zed", "description": "", "image_path": "Zed/Zed.jpg", "encoding_path": "Zed/Zed.json"}]"#;
        fs::write(dir.path().join(CATALOG_FILE), catalog).unwrap();

        let mut store = IdentityStore::open(dir.path()).unwrap();
        let alice = store.create("Alice", "", &portrait([255, 0, 0])).unwrap();

        assert_eq!(alice.id, 1);
        let records: Vec<_> = store.identities().iter().map(|i| (i.id, i.name.as_str())).collect();
        assert_eq!(records, vec![(0, "Zed"), (1, "Alice")]);
    }

    #[test]
    fn test_scan_appends_next_to_id_zero() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = r#"[{"id": 0, "name": "Zed"}]"#;
        fs::write(dir.path().join(CATALOG_FILE), catalog).unwrap();
        write_png(&dir.path().join("Dana.png"), [0, 0, 255]);

        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.scan(&mut PixelAnalyzer);

        assert_eq!(store.get("Zed").unwrap().id, 0);
        assert_eq!(store.get("Dana").unwrap().id, 1);
    }

    #[test]
    fn test_exhausted_ids_fail_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = format!(r#"[{{"id": {}, "name": "Last"}}]"#, u32::MAX);
        fs::write(dir.path().join(CATALOG_FILE), catalog).unwrap();

        let mut store = IdentityStore::open(dir.path()).unwrap();
        assert!(matches!(store.next_id(), Err(StoreError::IdsExhausted)));
        let result = store.create("Alice", "", &portrait([255, 0, 0]));
        assert!(matches!(result, Err(StoreError::IdsExhausted)));
        assert!(!dir.path().join("Alice").exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CATALOG_FILE), "{not json").unwrap();
        assert!(matches!(IdentityStore::open(dir.path()), Err(StoreError::Catalog(_))));
    }

    #[test]
    fn test_scan_ingests_loose_image() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("Dana.png"), [0, 0, 255]);
        let mut store = IdentityStore::open(dir.path()).unwrap();

        let report = store.scan(&mut PixelAnalyzer);
        assert_eq!(report.added, vec!["Dana".to_string()]);
        assert!(!dir.path().join("Dana.png").exists());
        assert!(dir.path().join("Dana/Dana.png").is_file());
        assert!(dir.path().join("Dana/Dana.json").is_file());
        assert_eq!(store.get("Dana").unwrap().id, 1);
    }

    #[test]
    fn test_scan_leaves_faceless_image_in_place() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("Nobody.png"), [0, 0, 0]);
        let mut store = IdentityStore::open(dir.path()).unwrap();

        let report = store.scan(&mut PixelAnalyzer);
        assert!(report.added.is_empty());
        assert_eq!(report.skipped, 1);
        assert!(dir.path().join("Nobody.png").is_file());
        assert!(!dir.path().join("Nobody").exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_encodes_folder_without_embedding() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("Eve")).unwrap();
        write_png(&dir.path().join("Eve/photo.png"), [0, 255, 0]);
        let mut store = IdentityStore::open(dir.path()).unwrap();

        let report = store.scan(&mut PixelAnalyzer);
        assert_eq!(report.added, vec!["Eve".to_string()]);
        assert_eq!(report.encoded, 1);
        assert!(dir.path().join("Eve/Eve.json").is_file());
        assert_eq!(store.get("Eve").unwrap().image_path, PathBuf::from("Eve/photo.png"));
    }

    #[test]
    fn test_scan_skips_catalogued_folders_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();

        let first = store.scan(&mut PixelAnalyzer);
        let second = store.scan(&mut PixelAnalyzer);
        assert!(first.added.is_empty() && second.added.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_loose_image_with_taken_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.create("Alice", "", &portrait([255, 0, 0])).unwrap();
        write_png(&dir.path().join("Alice.png"), [0, 255, 0]);

        let report = store.scan(&mut PixelAnalyzer);
        assert_eq!(report.added, vec!["Alice_2".to_string()]);
        assert!(dir.path().join("Alice/Alice.jpg").is_file());
        assert!(dir.path().join("Alice_2/Alice_2.png").is_file());
    }
}
