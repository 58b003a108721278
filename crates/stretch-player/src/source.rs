//! Compressed media sources.
//!
//! A [`MediaSource`] names where the compressed stream lives; [`MediaSource::open_stream`]
//! turns it into a Symphonia byte source for probing.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PlayerError, Result};

/// Location of a compressed audio stream.
#[derive(Clone, Debug)]
pub enum MediaSource {
    /// A file on disk.
    Path(PathBuf),
    /// An in-memory resource (for example `include_bytes!` data).
    Bytes {
        data: Arc<[u8]>,
        extension: Option<String>,
    },
    /// A byte range inside a larger file, such as an entry in a packed resource archive.
    FileRegion {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl MediaSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(data: impl Into<Arc<[u8]>>, extension: Option<&str>) -> Self {
        Self::Bytes {
            data: data.into(),
            extension: extension.map(str::to_string),
        }
    }

    pub fn file_region(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self::FileRegion {
            path: path.into(),
            offset,
            length,
        }
    }

    /// Container extension used as a probe hint, if known.
    pub fn extension_hint(&self) -> Option<String> {
        match self {
            Self::Path(path) | Self::FileRegion { path, .. } => extension_of(path),
            Self::Bytes { extension, .. } => extension.clone(),
        }
    }

    /// Short human-readable label for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes { data, .. } => format!("<{} bytes in memory>", data.len()),
            Self::FileRegion {
                path,
                offset,
                length,
            } => format!("{}[{offset}..+{length}]", path.display()),
        }
    }

    /// Open the source as a Symphonia byte stream.
    pub fn open_stream(&self) -> Result<Box<dyn symphonia::core::io::MediaSource>> {
        match self {
            Self::Path(path) => {
                let file = File::open(path)?;
                Ok(Box::new(file))
            }
            Self::Bytes { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
            Self::FileRegion {
                path,
                offset,
                length,
            } => Ok(Box::new(RegionSource::open(path, *offset, *length)?)),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Read/seek view over `[start, start + len)` of a file.
struct RegionSource {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl RegionSource {
    fn open(path: &Path, start: u64, len: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let end = start
            .checked_add(len)
            .ok_or_else(|| PlayerError::invalid_argument("file region overflows"))?;
        if end > file_len {
            return Err(PlayerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("region ends at {end} but file has {file_len} bytes"),
            )));
        }
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            start,
            len,
            pos: 0,
        })
    }
}

impl Read for RegionSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RegionSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => Some(x),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of region")
        })?;
        self.pos = target.min(self.len);
        Ok(self.pos)
    }
}

impl symphonia::core::io::MediaSource for RegionSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}
