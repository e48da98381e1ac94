use std::fmt;
use std::fs;
use std::str::FromStr;

use camino::Utf8Path;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Stage, Uid};
use crate::error::BeaconError;
use crate::records::{ModelRecord, RecordStore};

/// Model-data sources known at build time. New sources get a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    SwissModel,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 1] = [LoaderKind::SwissModel];

    pub fn as_str(self) -> &'static str {
        match self {
            LoaderKind::SwissModel => "swissmodel",
        }
    }

    pub fn parse_document(
        self,
        content: &str,
        coordinates: Option<&str>,
    ) -> Result<ModelData, BeaconError> {
        match self {
            LoaderKind::SwissModel => swissmodel_model_data(content, coordinates),
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoaderKind {
    type Err = BeaconError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        LoaderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| {
                let known: Vec<&str> = LoaderKind::ALL.iter().map(|kind| kind.as_str()).collect();
                BeaconError::UnknownLoader(format!("{value} (known: {})", known.join(", ")))
            })
    }
}

/// Summary of one repository model, stored in `model_data` on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub source: String,
    pub uniprot_accession: String,
    pub coordinates: String,
    pub template: Option<String>,
    pub method: Option<String>,
    pub gmqe: Option<f64>,
    pub uniprot_from: Option<u64>,
    pub uniprot_to: Option<u64>,
    pub identity: Option<f64>,
    pub similarity: Option<f64>,
    pub oligo_state: Option<String>,
    pub coverage: Option<f64>,
    pub qmean_avg_local_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SwissModelResponse {
    query: SwissModelQuery,
    result: SwissModelResult,
}

#[derive(Debug, Deserialize)]
struct SwissModelQuery {
    ac: String,
}

#[derive(Debug, Deserialize)]
struct SwissModelResult {
    #[serde(default)]
    structures: Vec<SwissModelStructure>,
}

#[derive(Debug, Deserialize)]
struct SwissModelStructure {
    coordinates: String,
    template: Option<String>,
    method: Option<String>,
    gmqe: Option<f64>,
    from: Option<u64>,
    to: Option<u64>,
    identity: Option<f64>,
    similarity: Option<f64>,
    oligo_state: Option<String>,
    coverage: Option<f64>,
    qmean: Option<SwissModelQmean>,
}

#[derive(Debug, Deserialize)]
struct SwissModelQmean {
    avg_local_score: Option<f64>,
}

fn swissmodel_model_data(
    content: &str,
    coordinates: Option<&str>,
) -> Result<ModelData, BeaconError> {
    let response: SwissModelResponse = serde_json::from_str(content)
        .map_err(|err| BeaconError::LoaderData(format!("invalid SWISS-MODEL response: {err}")))?;
    let accession = response.query.ac;
    let mut structures = response.result.structures.into_iter();

    let structure = match coordinates {
        Some(uri) => structures
            .find(|structure| structure.coordinates == uri)
            .ok_or_else(|| {
                BeaconError::LoaderData(format!("no structure with coordinates {uri} for {accession}"))
            })?,
        None => structures.next().ok_or_else(|| {
            BeaconError::LoaderData(format!("no structures listed for {accession}"))
        })?,
    };

    Ok(ModelData {
        source: LoaderKind::SwissModel.as_str().to_string(),
        uniprot_accession: accession,
        coordinates: structure.coordinates,
        template: structure.template,
        method: structure.method,
        gmqe: structure.gmqe,
        uniprot_from: structure.from,
        uniprot_to: structure.to,
        identity: structure.identity,
        similarity: structure.similarity,
        oligo_state: structure.oligo_state,
        coverage: structure.coverage,
        qmean_avg_local_score: structure.qmean.and_then(|qmean| qmean.avg_local_score),
    })
}

/// Reads `document` with the given loader and commits the model-data stage
/// for `uid` in one step.
pub fn load_model_data(
    records: &dyn RecordStore,
    uid: &Uid,
    kind: LoaderKind,
    document: &Utf8Path,
    coordinates: Option<&str>,
) -> Result<ModelRecord, BeaconError> {
    let content = fs::read_to_string(document.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("read {document}: {err}")))?;
    let data = kind.parse_document(&content, coordinates)?;
    info!(uid = %uid, loader = %kind, accession = %data.uniprot_accession, "loading model data");

    let value = serde_json::to_value(&data)
        .map_err(|err| BeaconError::LoaderData(err.to_string()))?;
    let record = records.commit_stage(uid, Stage::ModelData, Utc::now(), &|record| {
        record.identity = data.identity;
        record.similarity = data.similarity;
        record.oligo_state = data.oligo_state.clone();
        record.coverage = data.coverage;
        record.model_data = Some(value.clone());
    })?;
    if record.model_data_created_at.is_some_and(|at| at < record.updated_at) {
        warn!(uid = %uid, "model data replaced; stage timestamp kept from first load");
    }
    Ok(record)
}
