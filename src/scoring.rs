use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::LocalQmeanSettings;
use crate::domain::ScoringMode;
use crate::error::BeaconError;
use crate::remote::{CancelToken, JobPoller, QmeanTransport};
use crate::tool;

const STAGED_MODEL: &str = "model.pdb";
const STAGED_SEQRES: &str = "seqres.fasta";

/// Score document as returned by QMEAN, whichever way it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreDocument(Value);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSummary {
    pub qmean_version: Option<String>,
    pub avg_local_score: Option<f64>,
    pub original_name: Option<String>,
}

impl ScoreDocument {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn parse(text: &str) -> Result<Self, BeaconError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| BeaconError::ScoreParse(err.to_string()))?;
        if !value.is_object() {
            return Err(BeaconError::ScoreParse(
                "score document is not a JSON object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Reads the first model's global scores. `avg_local_score` falls back
    /// to `qmean4_norm_score` for older QMEAN releases.
    pub fn summary(&self) -> ScoreSummary {
        let model = self
            .0
            .get("models")
            .and_then(|models| models.as_object())
            .and_then(|models| models.values().next());
        let global = model
            .and_then(|model| model.get("scores"))
            .and_then(|scores| scores.get("global_scores"));
        let avg_local_score = global
            .and_then(|global| {
                global
                    .get("avg_local_score")
                    .or_else(|| global.get("qmean4_norm_score"))
            })
            .and_then(|value| value.as_f64());
        let qmean_version = self
            .0
            .get("qmean_version")
            .or_else(|| model.and_then(|model| model.get("qmean_version")))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        let original_name = model
            .and_then(|model| model.get("original_name"))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());

        ScoreSummary {
            qmean_version,
            avg_local_score,
            original_name,
        }
    }
}

pub trait QualityScore: Send + Sync {
    fn score(&self, structure: &Path, cancel: &CancelToken)
    -> Result<ScoreDocument, BeaconError>;
}

pub struct QualityScorer<T: QmeanTransport> {
    mode: ScoringMode,
    poller: JobPoller<T>,
    contact_email: Option<String>,
    local: LocalQmeanSettings,
}

impl<T: QmeanTransport> QualityScorer<T> {
    pub fn new(
        mode: ScoringMode,
        poller: JobPoller<T>,
        contact_email: Option<String>,
        local: LocalQmeanSettings,
    ) -> Self {
        Self {
            mode,
            poller,
            contact_email,
            local,
        }
    }

    pub fn score_with(
        &self,
        structure: &Path,
        mode: ScoringMode,
        cancel: &CancelToken,
    ) -> Result<ScoreDocument, BeaconError> {
        let document = match mode {
            ScoringMode::Remote => self.score_remote(structure, cancel)?,
            ScoringMode::Local => self.score_local(structure)?,
        };
        let summary = document.summary();
        if let (Some(name), Some(file)) = (&summary.original_name, structure.file_name()) {
            if name.as_str() != file.to_string_lossy() {
                warn!(expected = %file.to_string_lossy(), got = %name, "score document names a different model");
            }
        }
        Ok(document)
    }

    fn score_remote(
        &self,
        structure: &Path,
        cancel: &CancelToken,
    ) -> Result<ScoreDocument, BeaconError> {
        let email = self.contact_email.as_deref().ok_or_else(|| {
            BeaconError::ConfigParse("contact_email is required for remote scoring".to_string())
        })?;
        info!(structure = %structure.display(), "running remote QMEAN analysis");
        let body = self.poller.run(structure, email, cancel)?;
        Ok(ScoreDocument::from_value(body))
    }

    fn score_local(&self, structure: &Path) -> Result<ScoreDocument, BeaconError> {
        let settings = &self.local;
        let image = settings.image.as_deref().ok_or_else(|| missing_local("qmean_docker_image"))?;
        let uniclust = settings
            .uniclust_path
            .as_deref()
            .ok_or_else(|| missing_local("uniclust_path"))?;
        let qmtl = settings
            .qmtl_path
            .as_deref()
            .ok_or_else(|| missing_local("qmtl_path"))?;

        // Removed on drop, including on every error path below.
        let workdir = tempfile::Builder::new()
            .prefix("beacon-qmean")
            .tempdir()
            .map_err(|err| BeaconError::Filesystem(err.to_string()))?;
        let staged = workdir.path();
        debug!(dir = %staged.display(), "staging QMEAN inputs");

        let content = fs::read_to_string(structure).map_err(|err| {
            BeaconError::Filesystem(format!("read {}: {err}", structure.display()))
        })?;
        fs::write(staged.join(STAGED_MODEL), &content)
            .map_err(|err| BeaconError::Filesystem(err.to_string()))?;
        fs::write(staged.join(STAGED_SEQRES), seqres_fasta(&content))
            .map_err(|err| BeaconError::Filesystem(err.to_string()))?;

        let mount = |host: &Path, guest: &str| -> OsString {
            format!("{}:{guest}", host.display()).into()
        };
        let staged_str = staged.display().to_string();
        let args: Vec<OsString> = vec![
            "run".into(),
            "--rm".into(),
            "-v".into(),
            mount(staged, &staged_str),
            "-v".into(),
            mount(uniclust, "/uniclust30"),
            "-v".into(),
            mount(qmtl, "/qmtl"),
            "-w".into(),
            staged_str.clone().into(),
            image.into(),
            "run_qmean.py".into(),
            STAGED_MODEL.into(),
            "--seqres".into(),
            STAGED_SEQRES.into(),
        ];

        info!(structure = %structure.display(), image, "running local QMEAN analysis");
        let run = tool::run_tool(&settings.container_exe, &args, Some(staged))?;
        if !run.success() {
            let (stderr, code) = (run.stderr(), run.code());
            error!(command = %run.command, code = ?code, stderr = %stderr, stdout = %run.stdout(), "local QMEAN run failed");
            return Err(BeaconError::ScoringTool {
                command: run.command,
                stderr,
                code,
            });
        }
        ScoreDocument::parse(&run.stdout())
    }
}

impl<T: QmeanTransport> QualityScore for QualityScorer<T> {
    fn score(
        &self,
        structure: &Path,
        cancel: &CancelToken,
    ) -> Result<ScoreDocument, BeaconError> {
        self.score_with(structure, self.mode, cancel)
    }
}

fn missing_local(key: &str) -> BeaconError {
    BeaconError::ConfigParse(format!("{key} is required for local scoring"))
}

/// One FASTA record per chain, built from CA atoms in file order.
pub fn seqres_fasta(pdb: &str) -> String {
    let mut chains: BTreeMap<String, String> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut last_residue: Option<(String, String)> = None;

    for line in pdb.lines() {
        if line.starts_with("ENDMDL") {
            break;
        }
        if !(line.starts_with("ATOM") || line.starts_with("HETATM")) || line.len() < 27 {
            continue;
        }
        if line.get(12..16).map(str::trim) != Some("CA") {
            continue;
        }
        let Some(res_name) = line.get(17..20).map(str::trim) else {
            continue;
        };
        let one_letter = match three_to_one(res_name) {
            Some(code) => code,
            None if line.starts_with("ATOM") => 'X',
            None => continue,
        };
        let chain = line.get(21..22).unwrap_or(" ").trim().to_string();
        let residue_id = line.get(22..27).unwrap_or("").to_string();
        let key = (chain.clone(), residue_id);
        if last_residue.as_ref() == Some(&key) {
            continue;
        }
        last_residue = Some(key);
        if !chains.contains_key(&chain) {
            order.push(chain.clone());
        }
        chains.entry(chain).or_default().push(one_letter);
    }

    let mut fasta = String::new();
    for chain in order {
        let name = if chain.is_empty() { "_" } else { chain.as_str() };
        fasta.push('>');
        fasta.push_str(name);
        fasta.push('\n');
        fasta.push_str(&chains[&chain]);
        fasta.push('\n');
    }
    fasta
}

fn three_to_one(code: &str) -> Option<char> {
    let letter = match code {
        "ALA" => 'A',
        "ARG" => 'R',
        "ASN" => 'N',
        "ASP" => 'D',
        "CYS" => 'C',
        "GLN" => 'Q',
        "GLU" => 'E',
        "GLY" => 'G',
        "HIS" => 'H',
        "ILE" => 'I',
        "LEU" => 'L',
        "LYS" => 'K',
        "MET" | "MSE" => 'M',
        "PHE" => 'F',
        "PRO" => 'P',
        "SER" => 'S',
        "THR" => 'T',
        "TRP" => 'W',
        "TYR" => 'Y',
        "VAL" => 'V',
        "SEC" => 'U',
        "PYL" => 'O',
        _ => return None,
    };
    Some(letter)
}
