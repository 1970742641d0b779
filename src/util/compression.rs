//! Reversible file compression.
//!
//! The algorithm of a compressed artifact is encoded in its file extension, so
//! [decompress] needs no further information.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use derive_more::Display;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Compression algorithm applied to an artifact.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    #[display("gzip")]
    Gzip,
    #[display("bzip2")]
    Bzip2,
    #[display("none")]
    None,
}

impl CompressionAlgorithm {
    /// File extension appended by the algorithm, including the dot.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some(".gz"),
            Self::Bzip2 => Some(".bz2"),
            Self::None => None,
        }
    }

    /// Algorithm that produced `path`, judged by its extension.
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Self::Gzip,
            Some("bz2") => Self::Bzip2,
            _ => Self::None,
        }
    }
}

/// Compresses `path` into a sibling file carrying the algorithm's extension.
///
/// [CompressionAlgorithm::None] returns `path` unchanged. The source is left in place.
pub fn compress(path: &Path, algorithm: CompressionAlgorithm) -> io::Result<PathBuf> {
    let Some(extension) = algorithm.extension() else {
        return Ok(path.to_path_buf());
    };

    let mut target = OsString::from(path.as_os_str());
    target.push(extension);
    let target = PathBuf::from(target);

    let mut reader = BufReader::new(File::open(path)?);
    let writer = BufWriter::new(File::create_new(&target)?);

    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
        CompressionAlgorithm::Bzip2 => {
            let mut encoder = bzip2::write::BzEncoder::new(writer, bzip2::Compression::default());
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
        CompressionAlgorithm::None => unreachable!("handled above"),
    }

    log::debug!(target: "compression", "Compressed {} with {algorithm}", path.display());
    Ok(target)
}

/// Reverses [compress], stripping the extension of the detected algorithm.
///
/// Files without a known extension are returned unchanged.
pub fn decompress(path: &Path) -> io::Result<PathBuf> {
    let algorithm = CompressionAlgorithm::detect(path);
    if algorithm == CompressionAlgorithm::None {
        return Ok(path.to_path_buf());
    }

    let target = path.with_extension("");
    let reader = BufReader::new(File::open(path)?);
    let mut writer = BufWriter::new(File::create_new(&target)?);

    match algorithm {
        CompressionAlgorithm::Gzip => {
            io::copy(&mut GzDecoder::new(reader), &mut writer)?;
        }
        CompressionAlgorithm::Bzip2 => {
            io::copy(&mut bzip2::read::BzDecoder::new(reader), &mut writer)?;
        }
        CompressionAlgorithm::None => unreachable!("handled above"),
    }
    writer.flush()?;

    log::debug!(target: "compression", "Decompressed {} ({algorithm})", path.display());
    Ok(target)
}
