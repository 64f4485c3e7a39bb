//! The on-disk layout of a tiled history file.
//!
//! ```text
//! [static header: magic(u32) | fileVersion(u32) | providerVersion(u32) | configHeaderSize(u32)]
//! [config header: nPixels(u32) | nResolutions(u32) | startTime(i64) | endTime(i64) |
//!                 repeated per level: resolution(u64), nTiles(u32), tileOffsets[nTiles] of u64]
//! [tile section: contiguous serialised tiles]
//! ```
//!
//! All multi-byte integers are little-endian. A tile offset of `0` means
//! "tile never flushed, treat as empty".
//!
//! While building, tiles are appended to a staging file next to the final
//! path: the header's size depends on the final directory lengths, which
//! can still grow while tiles keep arriving. `finished_building` assembles
//! the final file in one pass (header, then the staged tile section) and
//! shifts every recorded offset accordingly.

use std::fs::File;
use std::io::{Read, Seek as _, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use parking_lot::Mutex;

use st_history_types::codec::{CodecError, CodecResult};
use st_history_types::{HistoryError, HistoryResult};

use crate::IGNORE_PROVIDER_VERSION;

// ---

pub(crate) const HISTORY_MAGIC: u32 = 0x05FF_B100;
pub(crate) const FILE_VERSION: u32 = 1;

/// Everything the header stores about one resolution level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LevelDirectory {
    pub resolution: i64,

    /// Absolute file offset of each tile; `0` = never flushed.
    pub offsets: Vec<u64>,
}

/// The decoded static + config header of a history file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub provider_version: u32,
    pub n_pixels: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub levels: Vec<LevelDirectory>,
}

impl FileHeader {
    /// Byte count of the config header (everything after the static
    /// header).
    pub fn config_size(&self) -> u32 {
        let per_level: usize = self
            .levels
            .iter()
            .map(|level| 8 + 4 + 8 * level.offsets.len())
            .sum();
        (4 + 4 + 8 + 8 + per_level) as u32
    }

    /// Byte count of the full header; the tile section starts here.
    pub fn total_size(&self) -> u64 {
        16 + u64::from(self.config_size())
    }

    pub fn encode(&self, write: &mut impl Write) -> CodecResult<()> {
        write.write_u32::<LittleEndian>(HISTORY_MAGIC)?;
        write.write_u32::<LittleEndian>(FILE_VERSION)?;
        write.write_u32::<LittleEndian>(self.provider_version)?;
        write.write_u32::<LittleEndian>(self.config_size())?;

        write.write_u32::<LittleEndian>(self.n_pixels)?;
        write.write_u32::<LittleEndian>(self.levels.len() as u32)?;
        write.write_i64::<LittleEndian>(self.start_time)?;
        write.write_i64::<LittleEndian>(self.end_time)?;

        for level in &self.levels {
            write.write_u64::<LittleEndian>(level.resolution as u64)?;
            write.write_u32::<LittleEndian>(level.offsets.len() as u32)?;
            for offset in &level.offsets {
                write.write_u64::<LittleEndian>(*offset)?;
            }
        }

        Ok(())
    }

    /// Decodes and validates a header.
    ///
    /// Pass [`IGNORE_PROVIDER_VERSION`] as `expected_provider_version` to
    /// skip the provider check.
    pub fn decode(read: &mut impl Read, expected_provider_version: u32) -> CodecResult<Self> {
        if read.read_u32::<LittleEndian>()? != HISTORY_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let file_version = read.read_u32::<LittleEndian>()?;
        if file_version != FILE_VERSION {
            return Err(CodecError::UnsupportedVersion(file_version));
        }
        let provider_version = read.read_u32::<LittleEndian>()?;
        if expected_provider_version != IGNORE_PROVIDER_VERSION
            && provider_version != expected_provider_version
        {
            return Err(CodecError::ProviderVersionMismatch {
                expected: expected_provider_version,
                got: provider_version,
            });
        }
        let _config_size = read.read_u32::<LittleEndian>()?;

        let n_pixels = read.read_u32::<LittleEndian>()?;
        let n_resolutions = read.read_u32::<LittleEndian>()?;
        let start_time = read.read_i64::<LittleEndian>()?;
        let end_time = read.read_i64::<LittleEndian>()?;

        let mut levels = Vec::with_capacity(n_resolutions as usize);
        for _ in 0..n_resolutions {
            let resolution = read.read_u64::<LittleEndian>()? as i64;
            let n_tiles = read.read_u32::<LittleEndian>()?;
            let mut offsets = Vec::with_capacity(n_tiles as usize);
            for _ in 0..n_tiles {
                offsets.push(read.read_u64::<LittleEndian>()?);
            }
            levels.push(LevelDirectory {
                resolution,
                offsets,
            });
        }

        Ok(Self {
            provider_version,
            n_pixels,
            start_time,
            end_time,
            levels,
        })
    }
}

// ----------------------------------------------------------------------------

/// The file handles of one tiled history.
///
/// Writes go through a dedicated append handle; reads go through a separate
/// handle behind a mutex, so queries never disturb the append position.
/// While building, both point at the staging file.
pub(crate) struct TileFile {
    path: PathBuf,
    staging_path: PathBuf,

    /// Staging append handle; `None` once finished (or when opened
    /// read-only).
    write: Option<File>,

    /// Next staging append position. Starts at 1: a single pad byte keeps
    /// offset 0 free to mean "never flushed".
    write_pos: u64,

    read: Mutex<File>,
}

impl TileFile {
    /// Creates a fresh history: an empty file at `path` and the staging
    /// file tiles are appended to until the build finishes.
    pub fn create(path: &Path) -> HistoryResult<Self> {
        // Claim the final path right away, so a half-built history is
        // visible (and cleaned up) on disk.
        drop(File::create(path)?);

        let staging_path = staging_path_for(path);
        let mut write = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)?;
        write.write_all(&[0_u8])?; // pad: offset 0 = "never flushed"

        let read = File::open(&staging_path)?;
        Ok(Self {
            path: path.to_owned(),
            staging_path,
            write: Some(write),
            write_pos: 1,
            read: Mutex::new(read),
        })
    }

    /// Opens an existing, finished file for reading.
    pub fn open(path: &Path) -> HistoryResult<Self> {
        let read = File::open(path)?;
        Ok(Self {
            path: path.to_owned(),
            staging_path: staging_path_for(path),
            write: None,
            write_pos: 0,
            read: Mutex::new(read),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one serialised tile, returning the offset it was written at
    /// (staging-relative while building; directory offsets are shifted to
    /// their final values by [`Self::finish`]).
    pub fn append_tile(&mut self, bytes: &[u8]) -> HistoryResult<u64> {
        let Some(write) = self.write.as_mut() else {
            return Err(HistoryError::Disposed);
        };
        let offset = self.write_pos;
        write.seek(SeekFrom::Start(offset))?;
        write.write_all(bytes)?;
        self.write_pos += bytes.len() as u64;
        Ok(offset)
    }

    /// Reads the serialised tile at `offset`, returning its payload with
    /// the leading `tileSize` field already stripped, plus that size.
    pub fn read_tile(&self, offset: u64) -> CodecResult<(u32, Vec<u8>)> {
        let mut read = self.read.lock();
        read.seek(SeekFrom::Start(offset)).map_err(CodecError::Read)?;

        let tile_size = read.read_u32::<LittleEndian>().map_err(truncated)?;
        if tile_size < 8 {
            return Err(CodecError::TruncatedTile);
        }
        let mut bytes = vec![0_u8; tile_size as usize - 4];
        read.read_exact(&mut bytes).map_err(truncated)?;

        Ok((tile_size, bytes))
    }

    /// Assembles the final file: header at offset 0, then the staged tile
    /// section. Returns the header with every tile offset shifted to its
    /// final absolute position; the caller re-syncs its directories from
    /// it.
    pub fn finish(&mut self, header: &FileHeader) -> HistoryResult<FileHeader> {
        let Some(staging_write) = self.write.take() else {
            return Err(HistoryError::Disposed);
        };
        staging_write.sync_all()?;
        drop(staging_write);

        // Staging offsets start at 1 (the pad byte); the tile section lands
        // right after the header.
        let shift = header.total_size() - 1;
        let mut final_header = header.clone();
        for level in &mut final_header.levels {
            for offset in &mut level.offsets {
                if *offset != 0 {
                    *offset += shift;
                }
            }
        }

        let mut bytes = Vec::with_capacity(final_header.total_size() as usize);
        final_header.encode(&mut bytes)?;

        let mut out = File::create(&self.path)?;
        out.write_all(&bytes)?;
        let mut staging = File::open(&self.staging_path)?;
        staging.seek(SeekFrom::Start(1))?;
        std::io::copy(&mut staging, &mut out)?;
        out.sync_all()?;

        // Queries go to the final file from here on.
        *self.read.lock() = File::open(&self.path)?;
        if let Err(err) = std::fs::remove_file(&self.staging_path) {
            st_log::warn!(
                "failed to delete staging file {:?}: {err}",
                self.staging_path
            );
        }

        Ok(final_header)
    }

    pub fn read_header(&self, expected_provider_version: u32) -> CodecResult<FileHeader> {
        let mut read = self.read.lock();
        read.seek(SeekFrom::Start(0)).map_err(CodecError::Read)?;
        FileHeader::decode(&mut *read, expected_provider_version)
    }

    /// Deletes the file (and any staging leftovers) from disk. Errors are
    /// logged, not propagated: this runs on cleanup paths.
    pub fn remove(&mut self) {
        self.write = None;
        for path in [&self.path, &self.staging_path] {
            if let Err(err) = std::fs::remove_file(path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                st_log::error!("failed to delete history file {path:?}: {err}");
            }
        }
    }
}

fn staging_path_for(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".part");
    PathBuf::from(staging)
}

fn truncated(err: std::io::Error) -> CodecError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::TruncatedTile
    } else {
        CodecError::Read(err)
    }
}

// ----------------------------------------------------------------------------
