//! Compressor
//!
//! Gzip-compresses chunks one by one. Every output is a standalone
//! single-member gzip stream, so each object can be decompressed on its own.

use crate::error::{Error, Result};
use crate::types::{Artifact, ArtifactStage};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Compress `chunk` into `<dest_dir>/<chunk filename>.gz`
///
/// The source chunk is kept. A partially written archive is removed on
/// failure.
pub fn compress(chunk: &Artifact, dest_dir: &Path) -> Result<Artifact> {
    std::fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(format!("{}.gz", chunk.file_name()));

    if let Err(e) = write_gzip(&chunk.path, &dest) {
        let _ = std::fs::remove_file(&dest);
        return Err(Error::compress(chunk.path.display().to_string(), e.to_string()));
    }

    let compressed = Artifact::from_path(&chunk.table, ArtifactStage::Compressed, dest)?;
    debug!(
        chunk = %chunk.path.display(),
        raw = chunk.size,
        compressed = compressed.size,
        "Compressed chunk"
    );
    Ok(compressed)
}

/// Compress every chunk independently, in order
pub fn compress_all(chunks: &[Artifact], dest_dir: &Path) -> Result<Vec<Artifact>> {
    chunks.iter().map(|chunk| compress(chunk, dest_dir)).collect()
}

fn write_gzip(source: &Path, dest: &Path) -> std::io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

/// Decompress a gzip file into memory
pub fn decompress(path: &Path) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::compress(path.display().to_string(), e.to_string()))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(dir: &Path, name: &str, content: &[u8]) -> Artifact {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        Artifact::from_path("orders", ArtifactStage::Chunk, path).unwrap()
    }

    #[test]
    fn test_compress_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let content = "\"1\"|\"ann\"\n\"2\"|\"bob\"\n".repeat(500);
        let source = chunk(dir.path(), "orders_0000.csv", content.as_bytes());
        let gzip_dir = dir.path().join("gzip").join("7");

        let compressed = compress(&source, &gzip_dir).unwrap();

        assert_eq!(compressed.stage, ArtifactStage::Compressed);
        assert_eq!(compressed.table, "orders");
        assert_eq!(compressed.path, gzip_dir.join("orders_0000.csv.gz"));
        assert!(compressed.size < source.size);
        assert!(source.path.exists());
        assert_eq!(decompress(&compressed.path).unwrap(), content.as_bytes());
    }

    #[test]
    fn test_compress_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let source = chunk(dir.path(), "empty.csv", b"");

        let compressed = compress(&source, dir.path()).unwrap();

        assert!(compressed.size > 0);
        assert!(decompress(&compressed.path).unwrap().is_empty());
    }

    #[test]
    fn test_compress_all_independent() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = vec![
            chunk(dir.path(), "orders_0000.csv", b"\"a\"\n"),
            chunk(dir.path(), "orders_0001.csv", b"\"b\"\n"),
        ];
        let out = dir.path().join("gz");

        let compressed = compress_all(&chunks, &out).unwrap();

        let names: Vec<&str> = compressed.iter().map(Artifact::file_name).collect();
        assert_eq!(names, vec!["orders_0000.csv.gz", "orders_0001.csv.gz"]);
        assert_eq!(decompress(&compressed[1].path).unwrap(), b"\"b\"\n");
    }

    #[test]
    fn test_compress_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = Artifact {
            table: "orders".to_string(),
            stage: ArtifactStage::Chunk,
            path: dir.path().join("ghost.csv"),
            size: 0,
        };

        let err = compress(&ghost, dir.path()).unwrap_err();

        assert!(matches!(err, Error::Compress { .. }));
        assert!(!dir.path().join("ghost.csv.gz").exists());
    }

    #[test]
    fn test_decompress_rejects_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.gz");
        std::fs::write(&path, b"not gzip").unwrap();
        assert!(decompress(&path).is_err());
    }
}
