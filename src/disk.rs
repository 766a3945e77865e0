//! Maps a torrent's pieces onto its files and performs the actual disk IO.
//!
//! Downloaded blocks address bytes as `(piece index, offset in piece)`, while
//! the bytes live in one or more files laid out back to back. The mapper
//! resolves the former into positioned writes into the latter, splitting
//! a block wherever it straddles a file boundary.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
};

use bitvec::prelude::*;
use nix::sys::uio::pwrite;

use crate::{
    error::*, storage_info::StorageInfo, Bitfield, FileInfo, PieceIndex,
};

/// The entity responsible for saving downloaded blocks to the torrent's
/// files.
///
/// All directories and files are created up front so that a failure to
/// allocate the torrent surfaces before any peer is contacted. Blocks are
/// written with positioned writes as they arrive; each write has reached the
/// OS by the time [`FileMapper::write_block`] returns, so a crash loses at
/// most the block being written.
pub(crate) struct FileMapper {
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation, in torrent order.
    files: Vec<TorrentFile>,
    /// All information concerning this torrent's storage.
    info: StorageInfo,
}

impl FileMapper {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// Already existing directories and files are reused, but no attempt is
    /// made to detect already downloaded pieces in them.
    pub fn new(info: &StorageInfo) -> Result<Self> {
        log::debug!("Setting up directory structure in {:?}", info.download_dir);
        fs::create_dir_all(&info.download_dir)?;

        let mut files = Vec::with_capacity(info.files.len());
        for file_info in info.files.iter() {
            if let Some(subdir) = file_info.path.parent() {
                fs::create_dir_all(subdir)?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&file_info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", file_info.path);
                    Error::Io(e)
                })?;
            files.push(TorrentFile {
                info: file_info.clone(),
                handle,
            });
        }

        Ok(Self {
            files,
            info: info.clone(),
        })
    }

    /// Returns which pieces are already on disk.
    ///
    /// Detecting existing downloads is not implemented, so this is always an
    /// all zeros bitfield.
    pub fn have(&self) -> Bitfield {
        bitvec![Msb0, u8; 0; self.info.piece_count]
    }

    /// Writes a block of a piece to the file, or files, that contain its byte
    /// range.
    pub fn write_block(
        &self,
        piece_index: PieceIndex,
        offset_in_piece: u32,
        data: &[u8],
    ) -> Result<()> {
        log::trace!(
            "Writing piece {} offset {} ({} bytes)",
            piece_index,
            offset_in_piece,
            data.len()
        );

        let mut torrent_offset = piece_index as u64 * self.info.piece_len as u64
            + offset_in_piece as u64;
        if torrent_offset + data.len() as u64 > self.info.download_len {
            return Err(Error::InvalidBlock);
        }

        let mut rest = data;
        while !rest.is_empty() {
            // checked above that the block is within the download, so there is
            // a file containing the offset
            let index = self
                .info
                .file_index_at(torrent_offset)
                .ok_or(Error::InvalidBlock)?;
            let file = &self.files[index];
            let slice = file.info.chunk_at(torrent_offset, rest.len() as u64);
            let (chunk, tail) = rest.split_at(slice.len as usize);
            file.write_at(chunk, slice.offset)?;
            rest = tail;
            torrent_offset += slice.len;
        }

        Ok(())
    }

    /// Syncs all files to disk. Called once when the download completes.
    pub fn flush(&self) -> Result<()> {
        for file in self.files.iter() {
            file.handle.sync_all()?;
        }
        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the given offset in file.
    ///
    /// IO syscalls are not guaranteed to write the whole input buffer in one
    /// go, so we need to write until all bytes have been confirmed to be
    /// written (or an error occurs).
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            let write_count = pwrite(
                self.handle.as_raw_fd(),
                buf,
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                match e.as_errno() {
                    Some(errno) => io::Error::from_raw_os_error(errno as i32),
                    None => io::Error::new(io::ErrorKind::Other, e),
                }
            })?;
            if write_count == 0 {
                return Err(Error::Io(io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[write_count..];
            offset += write_count as u64;
        }
        Ok(())
    }
}
