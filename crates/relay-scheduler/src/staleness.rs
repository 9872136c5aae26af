//! Configure staleness check.

use std::io;
use std::path::Path;

/// Whether `generated` must be regenerated from `source`.
///
/// True when the generated file is missing or older than its source. A
/// missing source also answers true so the configure step reports the real
/// problem.
pub async fn needs_regeneration(source: &Path, generated: &Path) -> io::Result<bool> {
    let generated_mtime = match tokio::fs::metadata(generated).await {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let source_mtime = match tokio::fs::metadata(source).await {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    Ok(generated_mtime < source_mtime)
}
