//! Installed packages: a versioned record that a package was installed into
//! a scope, keyed by name and content hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::InstalledPkgId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPkg {
    pub id: InstalledPkgId,
    pub name: String,
    /// SHA-256 (hex) of `pkg_contents`.
    pub root_hash: String,
    pub pkg_contents: String,
}

impl InstalledPkg {
    pub fn new(name: impl Into<String>, pkg_contents: impl Into<String>) -> Self {
        let pkg_contents = pkg_contents.into();
        Self {
            id: InstalledPkgId::generate(),
            name: name.into(),
            root_hash: root_hash(pkg_contents.as_bytes()),
            pkg_contents,
        }
    }
}

/// Content hash used as a package's `root_hash`.
pub fn root_hash(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hex::encode(hasher.finalize())
}
