//! The external format converter that loads a file into the staging table.

use crate::config::{Settings, SourceSpec};
use crate::errors::{Result, StorageError};
use crate::ident::{Identifier, QualifiedTable};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// What to load and where.
#[derive(Debug, Clone)]
pub struct ConvertJob {
    pub input: PathBuf,
    pub destination: QualifiedTable,
    pub extra_args: Vec<String>,
}

impl ConvertJob {
    pub fn new(source: &SourceSpec, input: PathBuf, destination: QualifiedTable) -> Self {
        Self {
            input,
            destination,
            extra_args: source.ogropts.clone(),
        }
    }
}

/// Exit status and captured output of one converter run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ConversionReport {
    pub fn succeeded() -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn status_label(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => "(no output)".to_string(),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }

    /// `Ok` on success, otherwise a `Conversion` error carrying the output.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(StorageError::Conversion {
                status: self.status_label(),
                output: self.combined_output(),
            })
        }
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the conversion. A tool that ran and failed is reported through
    /// the returned report, not as an `Err`.
    async fn convert(&self, job: &ConvertJob) -> Result<ConversionReport>;
}

/// Loads files with GDAL's `ogr2ogr` into PostgreSQL.
pub struct Ogr2OgrConverter {
    program: PathBuf,
    connection: String,
    geometry_column: Identifier,
    timeout: Duration,
}

impl Ogr2OgrConverter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            program: settings.ogr2ogr.clone(),
            connection: settings.ogr_connection(),
            geometry_column: settings.geometry_column.clone(),
            timeout: settings.convert_timeout(),
        }
    }

    pub fn arguments(&self, job: &ConvertJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            "PostgreSQL".into(),
            "-lco".into(),
            format!("GEOMETRY_NAME={}", self.geometry_column).into(),
            "-lco".into(),
            "SPATIAL_INDEX=NONE".into(),
            "-lco".into(),
            "EXTRACT_SCHEMA_FROM_LAYER_NAME=YES".into(),
            "-nln".into(),
            job.destination.dotted().into(),
        ];
        args.extend(job.extra_args.iter().map(OsString::from));
        args.push(self.connection.clone().into());
        args.push(job.input.clone().into_os_string());
        args
    }
}

#[async_trait]
impl Converter for Ogr2OgrConverter {
    fn name(&self) -> &'static str {
        "ogr2ogr"
    }

    async fn convert(&self, job: &ConvertJob) -> Result<ConversionReport> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments(job));
        log::info!(
            "Loading {} into {} with {}",
            job.input.display(),
            job.destination.dotted(),
            self.program.display()
        );
        run_captured(cmd, self.timeout).await
    }
}

/// Runs a command to completion with both output streams captured.
///
/// The child is killed if `timeout` elapses first.
pub async fn run_captured(mut cmd: Command, timeout: Duration) -> Result<ConversionReport> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let child = cmd.spawn().map_err(|err| StorageError::Conversion {
        status: "failed to start".to_string(),
        output: format!("{program}: {err}"),
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ConversionReport {
                exit_code: output.status.code(),
                success: output.status.success(),
                timed_out: false,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => Ok(ConversionReport {
            exit_code: None,
            success: false,
            timed_out: true,
            stdout: String::new(),
            stderr: format!("{program} did not finish within {}s", timeout.as_secs()),
        }),
    }
}
