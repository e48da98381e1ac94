use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::ScoringMode;
use crate::error::BeaconError;

pub const DEFAULT_CONFIG_FILE: &str = "beacon.json";
pub const DEFAULT_QMEAN_SUBMIT_URL: &str = "https://swissmodel.expasy.org/qmean/submit/";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_WORKERS: usize = 5;

/// On-disk configuration; every key is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub records_dir: Option<String>,
    #[serde(default)]
    pub scoring_mode: Option<ScoringMode>,
    #[serde(default)]
    pub qmean_submit_url: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,
    #[serde(default)]
    pub uniclust_path: Option<String>,
    #[serde(default)]
    pub qmtl_path: Option<String>,
    #[serde(default)]
    pub qmean_docker_image: Option<String>,
    #[serde(default)]
    pub container_exe: Option<String>,
    #[serde(default)]
    pub gemmi_exe: Option<String>,
    #[serde(default)]
    pub node_exe: Option<String>,
    #[serde(default)]
    pub molstar_preprocess: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct QmeanSettings {
    pub submit_url: String,
    pub contact_email: Option<String>,
    pub poll_interval: Duration,
    /// `None` polls until the job finishes.
    pub poll_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LocalQmeanSettings {
    pub container_exe: PathBuf,
    pub image: Option<String>,
    pub uniclust_path: Option<PathBuf>,
    pub qmtl_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConverterSettings {
    pub gemmi_exe: PathBuf,
    pub node_exe: PathBuf,
    pub molstar_preprocess: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub work_dir: Utf8PathBuf,
    pub records_dir: Utf8PathBuf,
    pub scoring_mode: ScoringMode,
    pub qmean: QmeanSettings,
    pub local_qmean: LocalQmeanSettings,
    pub converter: ConverterSettings,
    pub workers: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path` (or `beacon.json` when present) and overlays the process
    /// environment.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BeaconError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| BeaconError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| BeaconError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BeaconError> {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    /// Resolution with an explicit variable lookup; environment values win
    /// over file values, file values win over defaults.
    pub fn resolve_with<F>(config: Config, lookup: F) -> Result<ResolvedConfig, BeaconError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let work_dir = match env("BEACON_WORK_DIR").or(config.work_dir) {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_work_dir()?,
        };
        let records_dir = env("BEACON_RECORDS_DIR")
            .or(config.records_dir)
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| work_dir.join("records"));

        let scoring_mode = match env("BEACON_SCORING_MODE") {
            Some(value) => parse_scoring_mode(&value)?,
            None => config.scoring_mode.unwrap_or(ScoringMode::Remote),
        };

        let poll_timeout_secs = match env("BEACON_POLL_TIMEOUT_SECS") {
            Some(value) => value.trim().parse::<u64>().map_err(|_| {
                BeaconError::ConfigParse(format!("BEACON_POLL_TIMEOUT_SECS: {value}"))
            })?,
            None => config.poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
        };
        let poll_interval_secs = config
            .poll_interval_secs
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(BeaconError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            work_dir,
            records_dir,
            scoring_mode,
            qmean: QmeanSettings {
                submit_url: env("QMEAN_SUBMIT_URL")
                    .or(config.qmean_submit_url)
                    .unwrap_or_else(|| DEFAULT_QMEAN_SUBMIT_URL.to_string()),
                contact_email: env("CONTACT_EMAIL").or(config.contact_email),
                poll_interval: Duration::from_secs(poll_interval_secs),
                poll_timeout: (poll_timeout_secs > 0)
                    .then(|| Duration::from_secs(poll_timeout_secs)),
            },
            local_qmean: LocalQmeanSettings {
                container_exe: env("BEACON_CONTAINER_EXE")
                    .or(config.container_exe)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("docker")),
                image: env("QMEAN_DOCKER_IMAGE").or(config.qmean_docker_image),
                uniclust_path: env("PATH_TO_LOCAL_UNICLUST")
                    .or(config.uniclust_path)
                    .map(PathBuf::from),
                qmtl_path: env("PATH_TO_LOCAL_QMTL")
                    .or(config.qmtl_path)
                    .map(PathBuf::from),
            },
            converter: ConverterSettings {
                gemmi_exe: env("GEMMI_BIN")
                    .or(config.gemmi_exe)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("gemmi")),
                node_exe: env("BEACON_NODE_EXE")
                    .or(config.node_exe)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("node")),
                molstar_preprocess: env("MOLSTAR_PREPROCESS_EXE")
                    .or(config.molstar_preprocess)
                    .map(PathBuf::from),
            },
            workers,
        })
    }
}

fn parse_scoring_mode(value: &str) -> Result<ScoringMode, BeaconError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(ScoringMode::Local),
        "remote" => Ok(ScoringMode::Remote),
        _ => Err(BeaconError::ConfigParse(format!(
            "BEACON_SCORING_MODE must be local|remote, got {value}"
        ))),
    }
}

fn default_work_dir() -> Result<Utf8PathBuf, BeaconError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("beacon").join("work_dir")).ok()
        })
        .ok_or_else(|| BeaconError::Filesystem("unable to resolve work directory".to_string()))
}
