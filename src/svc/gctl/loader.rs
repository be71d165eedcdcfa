//! # Loader module
//!
//! This module provide the file based specification source, a flat directory
//! of yaml or json documents

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::svc::gctl::GenericController;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read specification directory '{0}', {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("failed to read specification file '{0}', {1}")]
    ReadFile(PathBuf, std::io::Error),
    #[error("failed to parse specification file '{0}', {1}")]
    Parse(PathBuf, serde_yaml::Error),
    #[error("specification directory '{0}' holds no yaml or json file")]
    Empty(PathBuf),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// loads every GenericController document found at one directory level,
/// documents of other kinds are ignored and subdirectories are skipped
pub fn load_from_directory(dir: &Path) -> Result<Vec<GenericController>, Error> {
    let entries =
        std::fs::read_dir(dir).map_err(|err| Error::ReadDir(dir.to_path_buf(), err))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::ReadDir(dir.to_path_buf(), err))?;
        let path = entry.path();

        if path.is_dir() {
            debug!(path = %path.display(), "Skip subdirectory in specification directory");
            continue;
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("json") => files.push(path),
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(Error::Empty(dir.to_path_buf()));
    }

    files.sort();

    let mut specs = Vec::new();
    for path in files {
        let content =
            std::fs::read_to_string(&path).map_err(|err| Error::ReadFile(path.to_owned(), err))?;

        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|err| Error::Parse(path.to_owned(), err))?;

            let kind = value
                .get("kind")
                .and_then(serde_yaml::Value::as_str)
                .map(ToOwned::to_owned);

            match kind.as_deref() {
                Some("GenericController") => {
                    let spec: GenericController = serde_yaml::from_value(value)
                        .map_err(|err| Error::Parse(path.to_owned(), err))?;

                    debug!(
                        key = spec.key(),
                        path = %path.display(),
                        "Load specification from file",
                    );
                    specs.push(spec);
                }
                Some(kind) => {
                    debug!(
                        kind = kind,
                        path = %path.display(),
                        "Ignore document of foreign kind",
                    );
                }
                None => {}
            }
        }
    }

    info!(
        count = specs.len(),
        directory = %dir.display(),
        "Loaded specifications from directory",
    );

    Ok(specs)
}

// -----------------------------------------------------------------------------
// Unit tests
