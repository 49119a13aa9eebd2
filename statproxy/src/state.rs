//! The daily-sketch state file.
//!
//! Daily cardinality sketches outlive a restart by being written to disk on
//! shutdown and read back on start. The file is a JSON object of
//! `source → metric → base64(marshalled sketch)`.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use rustc_hash::FxHashMap;
use statproxy_core::{Snapshot, accumulator::SketchBlobs};
use tracing::{debug, warn};

/// The persisted daily sketches of every source.
pub type State = Snapshot<SketchBlobs>;

type Encoded = FxHashMap<String, FxHashMap<String, String>>;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`load`] and [`save`].
pub enum Error {
    /// Error reading the state file
    #[error("Failed to read state file {path:?}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error writing the state file
    #[error("Failed to write state file {path:?}: {source}")]
    Write {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The state file is not the expected JSON
    #[error("State file {path:?} is malformed: {source}")]
    Json {
        /// File path
        path: PathBuf,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// True if the state file simply does not exist yet.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut partial = OsString::from(path.as_os_str());
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Read the state file at `path`.
///
/// A leaf that is not valid base64 is logged and skipped.
///
/// # Errors
///
/// Function will return an error if the file cannot be read or is not a JSON
/// object of objects of strings.
pub async fn load(path: &Path) -> Result<State, Error> {
    let raw = tokio::fs::read(path).await.map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    let encoded: Encoded = serde_json::from_slice(&raw).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut state = State::default();
    for (source, metrics) in encoded {
        let mut blobs = SketchBlobs::default();
        for (metric, leaf) in metrics {
            match STANDARD.decode(leaf.as_bytes()) {
                Ok(blob) => {
                    blobs.insert(metric, blob);
                }
                Err(err) => warn!(%source, %metric, %err, "state leaf is not base64, skipped"),
            }
        }
        if !blobs.is_empty() {
            state.insert(source, blobs);
        }
    }
    debug!(path = %path.display(), sources = state.len(), "state loaded");
    Ok(state)
}

/// Write `state` to `path`, replacing any previous file.
///
/// The file is written next to `path` first and renamed over it, so a crash
/// mid-write leaves the previous state in place.
///
/// # Errors
///
/// Function will return an error if the file cannot be written.
pub async fn save(path: &Path, state: &State) -> Result<(), Error> {
    let encoded: Encoded = state
        .iter()
        .map(|(source, blobs)| {
            let leaves = blobs
                .iter()
                .map(|(metric, blob)| (metric.clone(), STANDARD.encode(blob)))
                .collect();
            (source.clone(), leaves)
        })
        .collect();
    let raw = serde_json::to_vec(&encoded).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let partial = partial_path(path);
    let write_err = |source| Error::Write {
        path: path.to_path_buf(),
        source: Box::new(source),
    };
    tokio::fs::write(&partial, &raw).await.map_err(write_err)?;
    tokio::fs::rename(&partial, path).await.map_err(write_err)?;
    debug!(path = %path.display(), sources = state.len(), "state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use statproxy_core::{Registry, SketchSet};

    use super::*;

    #[tokio::test]
    async fn saved_state_restores_daily_sketches() {
        let registry = Registry::default();
        for i in 0..250 {
            registry
                .get_or_create("app1")
                .insert_cardinality(SketchSet::Daily, "users", &format!("u{i}")).unwrap();
        }
        let state = registry.export_daily_state();

        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("data.tmp");
        save(&path, &state).await.unwrap();
        assert!(!partial_path(&path).exists());

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, state);

        let restored = Registry::default();
        restored.import_daily_state(&loaded);
        assert_eq!(restored.take_daily(), registry.take_daily());
    }

    #[tokio::test]
    async fn file_is_json_of_base64_leaves() {
        let mut blobs = SketchBlobs::default();
        blobs.insert("m".to_string(), vec![1, 2, 3]);
        let mut state = State::default();
        state.insert("app1".to_string(), blobs);

        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("data.tmp");
        save(&path, &state).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, r#"{"app1":{"m":"AQID"}}"#);
    }

    #[tokio::test]
    async fn bad_leaves_are_skipped() {
        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("data.tmp");
        std::fs::write(&path, r#"{"app1":{"good":"AQID","bad":"!!"},"app2":{"bad":"%"}}"#)
            .unwrap();

        let state = load(&path).await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state["app1"].len(), 1);
        assert_eq!(state["app1"]["good"], vec![1u8, 2, 3]);
    }

    #[tokio::test]
    async fn missing_and_malformed_files() {
        let dir = tempfile::tempdir().expect("directory could not be created");
        let missing = load(&dir.path().join("absent")).await.unwrap_err();
        assert!(missing.is_not_found());

        let path = dir.path().join("data.tmp");
        std::fs::write(&path, "[1, 2]").unwrap();
        let malformed = load(&path).await.unwrap_err();
        assert!(matches!(malformed, Error::Json { .. }));
        assert!(!malformed.is_not_found());
    }
}
