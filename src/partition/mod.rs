//! Partitioner
//!
//! Splits an exported artifact into chunks of at most `threshold` bytes,
//! cutting only at record boundaries. A record boundary is a newline outside
//! a quoted field, so quoted fields spanning several lines stay whole.
//!
//! # Overview
//!
//! Splitting takes two passes over the file:
//! 1. [`plan_chunks`] scans for record boundaries and packs records greedily
//!    into byte ranges
//! 2. each range is copied into `<stem>_<NNNN>.<ext>` next to the original
//!
//! The original is removed only after every chunk is on disk with the
//! expected size. Any failure removes the chunks written so far and leaves
//! the original in place.

use crate::database::QUOTE;
use crate::error::{Error, Result};
use crate::types::{Artifact, ArtifactStage};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default chunk ceiling (200 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 209_715_200;

const READ_BUFFER: usize = 64 * 1024;

/// Split `artifact` into chunks no larger than `threshold` bytes
///
/// An artifact at or below the threshold is returned untouched as the only
/// chunk. Chunks are returned in suffix order.
pub fn partition(artifact: &Artifact, threshold: u64) -> Result<Vec<Artifact>> {
    let path = artifact.path.as_path();
    if threshold == 0 {
        return Err(Error::partition(
            path.display().to_string(),
            "chunk size must be greater than zero",
        ));
    }

    let size = std::fs::metadata(path)?.len();
    if size <= threshold {
        debug!(path = %path.display(), size, "Below chunk size, not splitting");
        return Ok(vec![Artifact {
            stage: ArtifactStage::Chunk,
            size,
            ..artifact.clone()
        }]);
    }

    let ranges = plan_chunks(BufReader::with_capacity(READ_BUFFER, File::open(path)?), threshold)
        .map_err(|e| match e {
            Error::Partition { message, .. } => {
                Error::partition(path.display().to_string(), message)
            }
            other => other,
        })?;

    let mut written = Vec::with_capacity(ranges.len());
    match write_chunks(path, &ranges, &mut written) {
        Ok(()) => {
            std::fs::remove_file(path)?;
            info!(
                path = %path.display(),
                size,
                chunks = written.len(),
                "Split artifact"
            );
            Ok(written
                .into_iter()
                .zip(ranges)
                .map(|(chunk, range)| Artifact {
                    table: artifact.table.clone(),
                    stage: ArtifactStage::Chunk,
                    path: chunk,
                    size: range.end - range.start,
                })
                .collect())
        }
        Err(e) => {
            for chunk in &written {
                let _ = std::fs::remove_file(chunk);
            }
            Err(e)
        }
    }
}

/// Name of chunk `index` of `original` (`orders.csv` -> `orders_0003.csv`)
pub fn chunk_path(original: &Path, index: usize) -> PathBuf {
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");
    let name = match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{index:04}.{ext}"),
        None => format!("{stem}_{index:04}"),
    };
    original.with_file_name(name)
}

/// Greedy packing of records into chunk ranges
struct Packer {
    threshold: u64,
    chunk_start: u64,
    last_boundary: u64,
    ranges: Vec<Range<u64>>,
}

impl Packer {
    fn new(threshold: u64) -> Self {
        Self {
            threshold,
            chunk_start: 0,
            last_boundary: 0,
            ranges: Vec::new(),
        }
    }

    /// Record a boundary at byte `at`, closing the current chunk if the
    /// record ending there would overflow it
    fn boundary(&mut self, at: u64) -> Result<()> {
        if at - self.chunk_start > self.threshold {
            if self.last_boundary > self.chunk_start {
                self.ranges.push(self.chunk_start..self.last_boundary);
                self.chunk_start = self.last_boundary;
            }
            if at - self.chunk_start > self.threshold {
                return Err(Error::partition(
                    String::new(),
                    format!(
                        "record at byte {} is {} bytes, larger than the {} byte chunk size",
                        self.chunk_start,
                        at - self.chunk_start,
                        self.threshold
                    ),
                ));
            }
        }
        self.last_boundary = at;
        Ok(())
    }

    fn finish(mut self) -> Vec<Range<u64>> {
        if self.last_boundary > self.chunk_start {
            self.ranges.push(self.chunk_start..self.last_boundary);
        }
        self.ranges
    }
}

/// Pack the records of `reader` into byte ranges of at most `threshold`
///
/// Ranges are contiguous and cover the whole input. The last record may lack
/// a trailing newline. A record longer than `threshold` cannot be placed and
/// is an error.
pub fn plan_chunks(mut reader: impl Read, threshold: u64) -> Result<Vec<Range<u64>>> {
    let quote = QUOTE as u8;
    let mut buf = vec![0u8; READ_BUFFER];
    let mut packer = Packer::new(threshold);
    let mut in_quotes = false;
    let mut offset = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for (i, byte) in buf[..n].iter().enumerate() {
            if *byte == quote {
                in_quotes = !in_quotes;
            } else if *byte == b'\n' && !in_quotes {
                packer.boundary(offset + i as u64 + 1)?;
            }
        }
        offset += n as u64;
    }

    if offset > packer.last_boundary {
        packer.boundary(offset)?;
    }
    Ok(packer.finish())
}

/// Copy each range of `source` into its chunk file, recording every path created
///
/// Ranges are contiguous from byte 0, so the source is read sequentially.
fn write_chunks(source: &Path, ranges: &[Range<u64>], written: &mut Vec<PathBuf>) -> Result<()> {
    let mut reader = BufReader::with_capacity(READ_BUFFER, File::open(source)?);

    for (index, range) in ranges.iter().enumerate() {
        let chunk = chunk_path(source, index);
        let expected = range.end - range.start;

        let file = File::create(&chunk)?;
        written.push(chunk.clone());

        let mut writer = BufWriter::new(file);
        let copied = std::io::copy(&mut (&mut reader).take(expected), &mut writer)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;

        let on_disk = std::fs::metadata(&chunk)?.len();
        if copied != expected || on_disk != expected {
            return Err(Error::partition(
                chunk.display().to_string(),
                format!("expected {expected} bytes, wrote {copied}, found {on_disk} on disk"),
            ));
        }
        debug!(chunk = %chunk.display(), bytes = expected, "Wrote chunk");
    }

    Ok(())
}
