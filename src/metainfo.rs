//! Parses and validates torrent metainfo ("`.torrent`") files.
//!
//! Only the parts of the metainfo that the download engine consumes are
//! modeled: the announce url and the info dictionary. The optional keys
//! (creation date, comment, etc) are ignored by deserialization.

use sha1::{Digest, Sha1};

use crate::{error::*, PieceIndex, Sha1Hash};

/// The parsed and validated torrent metainfo.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The url of the torrent's tracker.
    pub announce: String,
    /// The torrent's info dictionary.
    pub info: Info,
}

impl Metainfo {
    /// Parses the raw contents of a torrent metainfo file and validates that
    /// it describes a torrent this engine can download.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Returns the SHA-1 hash of the bencoded info dictionary, which
    /// identifies the torrent towards trackers and peers.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns true if the torrent is a multi-file "archive" download.
    pub fn is_archive(&self) -> bool {
        self.info.files.is_some()
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The sum of the lengths of all files in the torrent.
    pub fn total_length(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.info.length.unwrap_or_default(),
        }
    }

    /// Returns the expected SHA-1 hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.info.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[pos..pos + 20]);
        Ok(hash)
    }

    /// Checks that the metainfo describes a torrent this engine can
    /// download.
    ///
    /// `from_bytes` validates what it parses, but the fields are public, so
    /// the engine revalidates whatever it is handed before building any
    /// state on top of it.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length is zero"));
        }
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces is not a sequence of 20 byte SHA-1 hashes",
            ));
        }

        match (&self.info.length, &self.info.files) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "torrent must be either single file or multi file",
                ));
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::InvalidMetainfo(
                        "multi file torrent has no files",
                    ));
                }
                for file in files.iter() {
                    if file.path.is_empty()
                        || file.path.iter().any(|p| {
                            p.is_empty() || p == ".." || p.contains('/')
                        })
                    {
                        return Err(Error::InvalidMetainfo(
                            "file has an invalid path",
                        ));
                    }
                }
            }
            _ => (),
        }

        // the piece hash table must cover the download length exactly
        let total_length = self.total_length();
        let piece_length = self.info.piece_length;
        let piece_count = (total_length + piece_length - 1) / piece_length;
        if piece_count != self.piece_count() as u64 {
            return Err(Error::InvalidMetainfo(
                "piece count doesn't match the download length",
            ));
        }

        Ok(())
    }
}

/// The torrent metainfo's info dictionary.
///
/// The fields are declared in bencode key order so that re-serializing for
/// the info hash produces a canonically sorted dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    /// The files of a multi file torrent. Mutually exclusive with `length`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    /// The download length of a single file torrent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// The name of the torrent. For a single file torrent this is the file
    /// name, for a multi file torrent the name of the containing directory.
    pub name: String,
    /// The nominal length of a piece.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// The concatenation of all pieces' 20 byte SHA-1 hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

/// A file entry of a multi file torrent.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    /// The file's length, in bytes.
    pub length: u64,
    /// The file's path segments, relative to the torrent's directory.
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Returns the raw metainfo of a single file torrent whose only piece is
    // the SHA-1 of `hello world`.
    fn single_file_metainfo() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker.test4:info");
        buf.extend_from_slice(
            b"d6:lengthi11e4:name4:test12:piece lengthi16e6:pieces20:",
        );
        buf.extend_from_slice(&Sha1::digest(b"hello world"));
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&single_file_metainfo()).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.test");
        assert_eq!(metainfo.info.name, "test");
        assert!(!metainfo.is_archive());
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.total_length(), 11);
        assert_eq!(
            metainfo.piece_hash(0).unwrap()[..],
            Sha1::digest(b"hello world")[..]
        );
        assert!(metainfo.piece_hash(1).is_err());
    }

    #[test]
    fn test_info_hash_is_hash_of_info_dict() {
        let buf = single_file_metainfo();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        // the info dictionary is everything after the `4:info` key up to the
        // last byte, which closes the outer dictionary
        let info_start =
            buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info = &buf[info_start..buf.len() - 1];

        assert_eq!(
            metainfo.create_info_hash().unwrap()[..],
            Sha1::digest(info)[..]
        );
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker.test4:info");
        buf.extend_from_slice(b"d5:filesl");
        buf.extend_from_slice(b"d6:lengthi6e4:pathl5:a.txtee");
        buf.extend_from_slice(b"d6:lengthi5e4:pathl3:sub5:b.txtee");
        buf.extend_from_slice(b"e4:name4:test12:piece lengthi16e6:pieces20:");
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_archive());
        assert_eq!(metainfo.total_length(), 11);
        assert_eq!(metainfo.piece_count(), 1);
        let files = metainfo.info.files.as_ref().unwrap();
        assert_eq!(files[0].path, vec!["a.txt"]);
        assert_eq!(files[1].path, vec!["sub", "b.txt"]);
    }

    #[test]
    fn test_reject_invalid_metainfo() {
        // not bencode at all
        assert!(Metainfo::from_bytes(b"not a torrent").is_err());

        // pieces not a multiple of 20 bytes
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker.test4:info");
        buf.extend_from_slice(
            b"d6:lengthi11e4:name4:test12:piece lengthi16e6:pieces3:abc",
        );
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));

        // piece count doesn't cover the download length
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker.test4:info");
        buf.extend_from_slice(
            b"d6:lengthi100e4:name4:test12:piece lengthi16e6:pieces20:",
        );
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
