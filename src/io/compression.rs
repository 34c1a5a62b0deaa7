//! Transparent decompression for input tables.
//!
//! Large primary tables are often shipped compressed. [`open_table`] opens a
//! path and, when the extension or the leading magic bytes identify a known
//! codec, wraps the file in the matching decoder. Output files are never
//! compressed: the append sink relies on plain append-mode writes.
//!
//! Codecs are compiled in through cargo features:
//! - **Gzip** (`.gz`) via `flate2` (feature `compression-gzip`)
//! - **Zstd** (`.zst`) via `zstd` (feature `compression-zstd`)
//! - **Bzip2** (`.bz2`) via `bzip2` (feature `compression-bzip2`)
//! - **Xz** (`.xz`) via `xz2` (feature `compression-xz`)

use crate::error::StageError;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Boxed byte source handed to the CSV layer.
pub type TableRead = Box<dyn Read + Send>;

/// A decompression codec known to this build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    #[cfg(feature = "compression-gzip")]
    Gzip,
    #[cfg(feature = "compression-zstd")]
    Zstd,
    #[cfg(feature = "compression-bzip2")]
    Bzip2,
    #[cfg(feature = "compression-xz")]
    Xz,
}

impl Codec {
    /// Every codec enabled in this build.
    pub fn all() -> &'static [Codec] {
        &[
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip,
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd,
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2,
            #[cfg(feature = "compression-xz")]
            Codec::Xz,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => "zstd",
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => "bzip2",
            #[cfg(feature = "compression-xz")]
            Codec::Xz => "xz",
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => &[".gz", ".gzip"],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[".zst", ".zstd"],
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => &[".bz2", ".bzip2"],
            #[cfg(feature = "compression-xz")]
            Codec::Xz => &[".xz"],
        }
    }

    fn magic(self) -> &'static [u8] {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => &[0x1f, 0x8b],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            // "BZh" plus a block size digit; bare "BZ" would match text headers.
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => &[0x42, 0x5a, 0x68],
            #[cfg(feature = "compression-xz")]
            Codec::Xz => &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
        }
    }

    fn wrap<R: Read + Send + 'static>(self, inner: R) -> std::io::Result<TableRead> {
        match self {
            #[cfg(feature = "compression-gzip")]
            Codec::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(inner))),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Ok(Box::new(zstd::stream::read::Decoder::new(inner)?)),
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => Ok(Box::new(bzip2::read::MultiBzDecoder::new(inner))),
            #[cfg(feature = "compression-xz")]
            Codec::Xz => Ok(Box::new(xz2::read::XzDecoder::new_multi_decoder(inner))),
        }
    }
}

/// Codec implied by the path's extension, case-insensitive.
pub fn detect_from_extension(path: impl AsRef<Path>) -> Option<Codec> {
    let lower = path.as_ref().to_string_lossy().to_lowercase();
    Codec::all()
        .iter()
        .copied()
        .find(|c| c.extensions().iter().any(|ext| lower.ends_with(ext)))
}

/// Codec whose signature starts `head`.
pub fn detect_from_magic(head: &[u8]) -> Option<Codec> {
    Codec::all()
        .iter()
        .copied()
        .find(|c| head.starts_with(c.magic()))
}

/// Wrap `reader` with a decoder if the extension or magic bytes call for one.
///
/// The extension is checked first; magic bytes are only peeked when the
/// extension is not recognized. The reader is never advanced by detection.
pub fn auto_detect_reader<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<TableRead> {
    if let Some(codec) = detect_from_extension(&path_hint) {
        return codec
            .wrap(BufReader::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }
    let mut buffered = BufReader::new(reader);
    let codec = {
        let head = buffered.fill_buf().context("peek stream header")?;
        detect_from_magic(head)
    };
    match codec {
        Some(codec) => codec
            .wrap(buffered)
            .with_context(|| format!("wrap reader with {} codec", codec.name())),
        None => Ok(Box::new(buffered)),
    }
}

/// Open a table file for reading. A missing or unreadable file is an
/// `IOError`.
pub fn open_table(path: impl AsRef<Path>) -> Result<TableRead> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| StageError::io(path, e))?;
    auto_detect_reader(file, path)
        .with_context(|| format!("setup decompression for {}", path.display()))
}
