use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use camino::Utf8Path;
use tracing::{error, info};

use crate::config::ConverterSettings;
use crate::domain::CoordinateFormat;
use crate::error::BeaconError;
use crate::store;
use crate::tool;

/// Transcodes coordinate files. Implementations publish `output` only after
/// a successful run.
pub trait FormatConvert: Send + Sync {
    fn convert(
        &self,
        input: &Utf8Path,
        output: &Utf8Path,
        target: CoordinateFormat,
    ) -> Result<(), BeaconError>;
}

/// `gemmi` for PDB -> mmCIF, the molstar preprocess script for mmCIF -> bCIF.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    settings: ConverterSettings,
}

impl ExternalConverter {
    pub fn new(settings: ConverterSettings) -> Self {
        Self { settings }
    }

    fn command_for(
        &self,
        target: CoordinateFormat,
        input: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<(PathBuf, Vec<OsString>), BeaconError> {
        match target {
            CoordinateFormat::Mmcif => Ok((
                self.settings.gemmi_exe.clone(),
                vec![
                    "convert".into(),
                    "--to".into(),
                    "mmcif".into(),
                    input.as_os_str().to_owned(),
                    output.as_os_str().to_owned(),
                ],
            )),
            CoordinateFormat::Bcif => {
                let preprocess = self.settings.molstar_preprocess.as_ref().ok_or_else(|| {
                    BeaconError::MissingTool("molstar preprocess script".to_string())
                })?;
                Ok((
                    self.settings.node_exe.clone(),
                    vec![
                        preprocess.as_os_str().to_owned(),
                        "-i".into(),
                        input.as_os_str().to_owned(),
                        "-ob".into(),
                        output.as_os_str().to_owned(),
                    ],
                ))
            }
        }
    }
}

impl FormatConvert for ExternalConverter {
    fn convert(
        &self,
        input: &Utf8Path,
        output: &Utf8Path,
        target: CoordinateFormat,
    ) -> Result<(), BeaconError> {
        // Deleted on drop unless persisted, so failures never leave debris
        // next to the canonical path.
        let temp = store::sibling_tempfile(output)?.into_temp_path();
        let temp_out = Utf8Path::from_path(&temp)
            .ok_or_else(|| BeaconError::Filesystem("non-utf8 temp path".to_string()))?
            .to_owned();

        let (program, args) = self.command_for(target, input, &temp_out)?;
        info!(input = %input, output = %output, format = %target, "converting structure");
        let run = tool::run_tool(&program, &args, None)?;

        if !run.success() {
            let (stdout, stderr, code) = (run.stdout(), run.stderr(), run.code());
            error!(command = %run.command, code = ?code, "failed to convert to {target}");
            error!("STDERR: {stderr}");
            error!("STDOUT: {stdout}");
            return Err(BeaconError::Conversion {
                command: run.command,
                stdout,
                stderr,
                code,
            });
        }

        let written = fs::metadata(temp_out.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written == 0 {
            let (stdout, code) = (run.stdout(), run.code());
            return Err(BeaconError::Conversion {
                command: run.command,
                stdout,
                stderr: "converter exited successfully but wrote no output".to_string(),
                code,
            });
        }

        store::publish_path(temp, output)
    }
}
