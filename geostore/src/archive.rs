//! Turns a downloaded payload into the file the converter reads.

use crate::config::{ArchiveFormat, SourceSpec};
use crate::errors::{Result, StorageError};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use zip::result::ZipError;

/// Writes the payload into `workdir` and returns the converter input path.
///
/// Sources with an archive descriptor get exactly the listed members
/// extracted; everything else in the archive is ignored. Sources without one
/// have the raw payload saved under their `file` name.
pub fn materialize(source: &SourceSpec, payload: &[u8], workdir: &Path) -> Result<PathBuf> {
    match &source.archive {
        Some(archive) => match archive.format {
            ArchiveFormat::Zip => {
                let extracted = extract_zip_members(payload, &archive.files, workdir)?;
                log::debug!(
                    "Extracted {} member(s) for '{}'",
                    extracted.len(),
                    source.name
                );
            }
        },
        None => {
            let target = workdir.join(&source.file);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, payload)?;
        }
    }

    let input = workdir.join(&source.file);
    if !input.is_file() {
        return Err(StorageError::Extraction(format!(
            "'{}' was not produced for source '{}'",
            source.file.display(),
            source.name
        )));
    }
    Ok(input)
}

/// Extracts the named members of a zip archive below `workdir`, keeping
/// their relative paths.
pub fn extract_zip_members(payload: &[u8], members: &[String], workdir: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(payload))?;
    let mut written = Vec::with_capacity(members.len());

    for member in members {
        let mut entry = match archive.by_name(member) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(StorageError::Extraction(format!(
                    "member '{member}' not found in archive"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let relative = entry.enclosed_name().ok_or_else(|| {
            StorageError::Extraction(format!("member '{member}' has an unsafe path"))
        })?;
        let target = workdir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
        written.push(target);
    }

    Ok(written)
}
