// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Discovery of the `cloud-access.yml` credentials file.
//!
//! The file is looked up in the working directory and then in each parent.
//! Besides the two secrets it may name the fleet and the gateway endpoint:
//!
//! ```yaml
//! access_key_id: AKIA...
//! secret_access_key: ...
//! fleet: web
//! endpoint: https://compute.example.com
//! ```

use std::path::{Path, PathBuf};

use flotilla_core::cloud::AccessCredentials;
use serde::Deserialize;
use thiserror::Error;

/// Name of the credentials file.
pub const ACCESS_FILE: &str = "cloud-access.yml";

const MIN_SECRET_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("No cloud-access.yml found in {} or any parent directory", start.display())]
    NotFound { start: PathBuf },

    #[error(
        "Found {} but no cloud-access.yml; copy the example next to it and fill in your credentials",
        example.display()
    )]
    ExampleOnly { example: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{field} in {} is shorter than 5 characters", path.display())]
    WeakSecret { path: PathBuf, field: &'static str },
}

#[derive(Deserialize)]
struct AccessFile {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    fleet: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
}

/// Contents of an access file.
#[derive(Debug, Clone)]
pub struct CloudAccess {
    pub path: PathBuf,
    pub credentials: AccessCredentials,
    pub fleet: Option<String>,
    pub endpoint: Option<String>,
}

/// Nearest access file at or above `start`.
///
/// The search stops at the first directory holding either the file or its
/// `.example`, so a project never falls through to a parent's credentials.
pub fn find(start: &Path) -> Result<PathBuf, AccessError> {
    for dir in start.ancestors() {
        let candidate = dir.join(ACCESS_FILE);
        if candidate.is_file() {
            return Ok(candidate);
        }
        let example = dir.join(format!("{ACCESS_FILE}.example"));
        if example.is_file() {
            return Err(AccessError::ExampleOnly { example });
        }
    }
    Err(AccessError::NotFound {
        start: start.to_path_buf(),
    })
}

/// Read and check the access file at `path`.
pub fn load(path: &Path) -> Result<CloudAccess, AccessError> {
    let text = std::fs::read_to_string(path).map_err(|source| AccessError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: AccessFile = serde_yaml::from_str(&text).map_err(|source| AccessError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    for (field, value) in [
        ("access_key_id", &file.access_key_id),
        ("secret_access_key", &file.secret_access_key),
    ] {
        if value.trim().len() < MIN_SECRET_LEN {
            return Err(AccessError::WeakSecret {
                path: path.to_path_buf(),
                field,
            });
        }
    }

    Ok(CloudAccess {
        path: path.to_path_buf(),
        credentials: AccessCredentials {
            access_key_id: file.access_key_id.trim().to_string(),
            secret_access_key: file.secret_access_key.trim().to_string(),
        },
        fleet: file.fleet.filter(|f| !f.trim().is_empty()),
        endpoint: file.endpoint.filter(|e| !e.trim().is_empty()),
    })
}

/// Find and load the nearest access file.
pub fn discover(start: &Path) -> Result<CloudAccess, AccessError> {
    load(&find(start)?)
}
