use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::domain::Uid;
use crate::error::BeaconError;

/// Salt mixed into every uid. Bumping it re-keys every model, so existing
/// records have to be migrated explicitly.
pub const DATA_MODEL_VERSION: &str = "1";

pub fn derive_uid(content: &[u8]) -> Uid {
    derive_uid_versioned(content, DATA_MODEL_VERSION)
}

pub fn derive_uid_versioned(content: &[u8], version: &str) -> Uid {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(version.as_bytes());
    Uid::from_digest_hex(hex::encode(hasher.finalize()))
}

pub fn uid_from_file(path: &Path) -> Result<Uid, BeaconError> {
    let content = fs::read(path)
        .map_err(|err| BeaconError::Filesystem(format!("read {}: {err}", path.display())))?;
    Ok(derive_uid(&content))
}
