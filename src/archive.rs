//! Packaging of a finished task's logs into a single zip archive.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;
use crate::logs::TaskFiles;

/// Writes `files` into a deflate-compressed zip at `output`, each stored
/// under its file name. A partially written archive is removed on failure.
pub fn zip_files(output: &Path, files: &[PathBuf]) -> Result<()> {
    let result = write_zip(output, files);
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    result
}

fn write_zip(output: &Path, files: &[PathBuf]) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(output)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        zip.start_file(name, options)?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Archives the trace and output logs and deletes them once the archive is
/// complete. On failure the originals are left in place.
pub fn archive_task_files(files: &TaskFiles) -> Result<()> {
    let sources = [files.trace.clone(), files.output.clone()];
    zip_files(&files.archive, &sources)?;
    for path in &sources {
        if let Err(error) = fs::remove_file(path) {
            tracing::warn!(
                target = "task_agent::archive",
                path = %path.display(),
                error = %error,
                "archived log could not be removed"
            );
        }
    }
    tracing::info!(
        target = "task_agent::archive",
        archive = %files.archive.display(),
        "task logs archived"
    );
    Ok(())
}
