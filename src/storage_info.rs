use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// A single file of the download.
///
/// The pieces of a torrent are cut from the concatenation of all its files,
/// so besides its path and length every file records where in that
/// conceptual byte array it begins.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The path the file is downloaded to.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// Where the file's first byte sits in the concatenation of all files.
    /// Zero for the first (or only) file.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The torrent byte offsets covered by this file, first byte inclusive,
    /// end exclusive.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }

    /// Returns where a write of `len` bytes at the given torrent offset
    /// lands in this file: the offset relative to the file's start, and how
    /// many of the bytes still fit before the file ends. The caller is
    /// expected to continue any remaining bytes in the next file.
    ///
    /// # Panics
    ///
    /// Panics if the torrent offset doesn't fall inside this file.
    pub(crate) fn chunk_at(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            self.byte_range().contains(&torrent_offset),
            "byte {} is outside of file {:?}",
            torrent_offset,
            self.path
        );
        let offset = torrent_offset - self.torrent_offset;
        FileSlice {
            offset,
            len: len.min(self.len - offset),
        }
    }
}

/// A contiguous run of bytes within one file, relative to the file's start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The offset of the run's first byte within the file.
    pub offset: u64,
    /// How many bytes the run covers.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The directory that contains the torrent's files.
    ///
    /// For a single file download this is the download directory itself, the
    /// file sitting directly in it. A multi file torrent's files would be
    /// scattered across the download directory the same way, which is an
    /// annoyance we want to avoid, so they are placed in a subdirectory named
    /// after the torrent.
    pub download_dir: PathBuf,
    /// All files of the torrent in torrent order, with resolved download
    /// paths and their offsets in the conceptual contiguous byte array that
    /// the pieces are cut from. A single file torrent is a one element list.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Result<Self> {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.total_length();
        if metainfo.info.piece_length > u32::MAX as u64 {
            return Err(Error::InvalidMetainfo("piece length too large"));
        }
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into the torrent's own dir
        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.info.name)
        } else {
            download_dir
        };

        let files = match &metainfo.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let mut path = download_dir.clone();
                        for segment in file.path.iter() {
                            path.push(segment);
                        }
                        let info = FileInfo {
                            path,
                            len: file.length,
                            torrent_offset,
                        };
                        torrent_offset += file.length;
                        info
                    })
                    .collect()
            }
            None => vec![FileInfo {
                path: download_dir.join(&metainfo.info.name),
                len: download_len,
                torrent_offset: 0,
            }],
        };

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        })
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the index of the file that contains the byte at the given
    /// torrent offset, or `None` if the offset is past the download's end.
    ///
    /// Since the files' byte ranges are the prefix sums of their lengths,
    /// they are sorted and a binary search finds the file.
    pub fn file_index_at(&self, torrent_offset: u64) -> Option<FileIndex> {
        let index = self
            .files
            .partition_point(|f| f.byte_range().end <= torrent_offset);
        self.files
            .get(index)
            .filter(|f| f.byte_range().contains(&torrent_offset))
            .map(|_| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A 24 byte file preceded by 40 bytes of earlier files. No IO happens
    // here, so the path is a dummy.
    fn middle_file() -> FileInfo {
        FileInfo {
            path: PathBuf::from("/nowhere/b.bin"),
            len: 24,
            torrent_offset: 40,
        }
    }

    #[test]
    fn test_chunk_at_caps_writes_at_the_file_end() {
        let file = middle_file();
        assert_eq!(file.byte_range(), 40..64);

        // a write that fits entirely inside the file
        assert_eq!(
            file.chunk_at(48, 8),
            FileSlice { offset: 8, len: 8 }
        );
        // a write covering the file exactly
        assert_eq!(
            file.chunk_at(40, 24),
            FileSlice { offset: 0, len: 24 }
        );
        // a write running past the file's end is capped, the rest belongs
        // to the next file
        assert_eq!(
            file.chunk_at(60, 100),
            FileSlice { offset: 20, len: 4 }
        );
        // the file's very last byte
        assert_eq!(
            file.chunk_at(63, 1),
            FileSlice { offset: 23, len: 1 }
        );
    }

    #[test]
    #[should_panic(expected = "outside of file")]
    fn test_chunk_at_before_the_file_panics() {
        middle_file().chunk_at(39, 8);
    }

    #[test]
    #[should_panic(expected = "outside of file")]
    fn test_chunk_at_past_the_file_panics() {
        middle_file().chunk_at(64, 8);
    }

    // A 48 byte download in four files of 5, 13, 6 and 24 bytes, so the
    // files cover the torrent offsets [0, 5), [5, 18), [18, 24), [24, 48).
    fn multi_file_storage() -> StorageInfo {
        let lens = [5u64, 13, 6, 24];
        let mut torrent_offset = 0;
        let files = lens
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let info = FileInfo {
                    path: PathBuf::from(format!("/nowhere/{}", i)),
                    len: *len,
                    torrent_offset,
                };
                torrent_offset += len;
                info
            })
            .collect::<Vec<_>>();
        let download_len: u64 = lens.iter().sum();
        StorageInfo {
            piece_count: 4,
            piece_len: 12,
            last_piece_len: 12,
            download_len,
            download_dir: PathBuf::from("/nowhere"),
            files,
        }
    }

    #[test]
    fn test_piece_len() {
        let mut info = multi_file_storage();
        info.last_piece_len = 4;
        assert_eq!(info.piece_len(0).unwrap(), 12);
        assert_eq!(info.piece_len(2).unwrap(), 12);
        assert_eq!(info.piece_len(3).unwrap(), 4);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_file_index_at() {
        let info = multi_file_storage();

        // file starts
        assert_eq!(info.file_index_at(0), Some(0));
        assert_eq!(info.file_index_at(5), Some(1));
        assert_eq!(info.file_index_at(24), Some(3));
        // file interiors and last bytes
        assert_eq!(info.file_index_at(4), Some(0));
        assert_eq!(info.file_index_at(20), Some(2));
        assert_eq!(info.file_index_at(47), Some(3));
        // past the download's end
        assert_eq!(info.file_index_at(48), None);
        assert_eq!(info.file_index_at(1000), None);
    }

    #[test]
    fn test_storage_offsets_are_prefix_sums() {
        let info = multi_file_storage();
        let mut offset = 0;
        for file in info.files.iter() {
            assert_eq!(file.torrent_offset, offset);
            offset += file.len;
        }
        assert_eq!(offset, info.download_len);
    }
}
