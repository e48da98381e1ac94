use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BeaconError;

static UID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("valid uid regex"));

/// Content-derived model identifier (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(String);

impl Uid {
    pub(crate) fn from_digest_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used to shard the work directory.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = BeaconError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if !UID_RE.is_match(&normalized) {
            return Err(BeaconError::InvalidUid(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Uid {
    type Error = BeaconError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Uid> for String {
    fn from(value: Uid) -> Self {
        value.0
    }
}

/// Files the pipeline publishes under the work directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Pdb,
    Mmcif,
    Bcif,
    QmeanJson,
}

impl ArtifactKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Pdb => ".pdb",
            ArtifactKind::Mmcif => ".mmcif",
            ArtifactKind::Bcif => ".bcif",
            ArtifactKind::QmeanJson => "_qmean.json",
        }
    }
}

/// Pipeline stages with a completion timestamp on the model record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pdb,
    Mmcif,
    Qmean,
    ModelData,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pdb => write!(f, "pdb"),
            Stage::Mmcif => write!(f, "mmcif"),
            Stage::Qmean => write!(f, "qmean"),
            Stage::ModelData => write!(f, "model_data"),
        }
    }
}

impl FromStr for Stage {
    type Err = BeaconError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pdb" => Ok(Stage::Pdb),
            "mmcif" => Ok(Stage::Mmcif),
            "qmean" => Ok(Stage::Qmean),
            "model_data" => Ok(Stage::ModelData),
            _ => Err(BeaconError::InvalidStage(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    Local,
    Remote,
}

impl fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringMode::Local => write!(f, "local"),
            ScoringMode::Remote => write!(f, "remote"),
        }
    }
}

/// Targets of the format converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormat {
    Mmcif,
    Bcif,
}

impl CoordinateFormat {
    pub fn artifact(self) -> ArtifactKind {
        match self {
            CoordinateFormat::Mmcif => ArtifactKind::Mmcif,
            CoordinateFormat::Bcif => ArtifactKind::Bcif,
        }
    }
}

impl fmt::Display for CoordinateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateFormat::Mmcif => write!(f, "mmcif"),
            CoordinateFormat::Bcif => write!(f, "bcif"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_uid_normalizes_case() {
        let raw = "AB".repeat(32);
        let uid: Uid = raw.parse().unwrap();
        assert_eq!(uid.as_str(), "ab".repeat(32));
        assert_eq!(uid.shard(), "ab");
    }

    #[test]
    fn parse_uid_rejects_short_or_non_hex() {
        assert_matches!("abc".parse::<Uid>(), Err(BeaconError::InvalidUid(_)));
        let bad = format!("{}zz", "0".repeat(62));
        assert_matches!(bad.parse::<Uid>(), Err(BeaconError::InvalidUid(_)));
    }

    #[test]
    fn stage_round_trips_through_display() {
        for stage in [Stage::Pdb, Stage::Mmcif, Stage::Qmean, Stage::ModelData] {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert_matches!("bcif".parse::<Stage>(), Err(BeaconError::InvalidStage(_)));
    }

    #[test]
    fn artifact_suffixes() {
        assert_eq!(ArtifactKind::QmeanJson.suffix(), "_qmean.json");
        assert_eq!(CoordinateFormat::Bcif.artifact().suffix(), ".bcif");
    }
}
