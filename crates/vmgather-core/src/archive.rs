//! Packages a staged JSONL stream plus a manifest into a self-describing
//! zip bundle and computes its content hash.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;
use zip::write::SimpleFileOptions;

use crate::error::{GatherError, Result};
use crate::model::ArchiveManifest;

/// Characters allowed in a generated archive file name. Anything else in the
/// export id is stripped so the archive name stays valid on Windows.
fn sanitize_for_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds the deterministic archive path for an export id within `output_dir`.
pub fn archive_path(output_dir: &Path, export_id: Uuid) -> PathBuf {
    let name = sanitize_for_filename(&format!("vmgather-{export_id}.zip"));
    output_dir.join(name)
}

/// Writes the archive at `archive_path`, containing exactly `metrics.jsonl`
/// (read verbatim from `staging_path`) and `manifest.json`. Returns the
/// archive's byte size and hex-encoded SHA-256, computed over the final
/// archive bytes as written.
pub fn write_archive(
    staging_path: &Path,
    manifest: &ArchiveManifest,
    archive_path: &Path,
) -> Result<(u64, String)> {
    let manifest_json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| GatherError::MarshalError(format!("manifest: {e}")))?;

    let mut metrics_bytes = Vec::new();
    std::fs::File::open(staging_path)
        .and_then(|mut f| f.read_to_end(&mut metrics_bytes))
        .map_err(|e| GatherError::StagingUnavailable(format!("reading staged metrics: {e}")))?;

    let mut zip_bytes = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut zip_bytes);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        writer
            .start_file("metrics.jsonl", options)
            .map_err(|e| GatherError::MarshalError(format!("zip entry metrics.jsonl: {e}")))?;
        writer
            .write_all(&metrics_bytes)
            .map_err(|e| GatherError::MarshalError(format!("writing metrics.jsonl: {e}")))?;

        writer
            .start_file("manifest.json", options)
            .map_err(|e| GatherError::MarshalError(format!("zip entry manifest.json: {e}")))?;
        writer
            .write_all(&manifest_json)
            .map_err(|e| GatherError::MarshalError(format!("writing manifest.json: {e}")))?;

        writer
            .finish()
            .map_err(|e| GatherError::MarshalError(format!("finishing archive: {e}")))?;
    }

    std::fs::write(archive_path, &zip_bytes)
        .map_err(|e| GatherError::StagingUnavailable(format!("writing archive: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&zip_bytes);
    let sha256 = hex::encode(hasher.finalize());

    Ok((zip_bytes.len() as u64, sha256))
}
