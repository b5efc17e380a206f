//! Single-file, whole-piece-granularity storage for the shared file.
//!
//! Unlike a general torrent client we always have exactly one file and
//! never verify piece hashes (the protocol has none), so there's no need
//! for the teacher's vectored multi-file writes or block-level buffering:
//! a piece is read or written in one synchronous call, guarded by a
//! regular mutex.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::{piece_count, piece_len, Bitfield, PeerId, PieceIndex};

struct Inner {
    file: File,
    bitfield: Bitfield,
    num_have: usize,
}

/// Owns the on-disk copy of the shared file for one peer process and the
/// bitfield tracking which pieces of it are present.
pub struct FileStore {
    inner: Mutex<Inner>,
    file_size: u64,
    piece_size: u32,
    num_pieces: usize,
}

impl FileStore {
    /// Opens (creating if necessary) the shared file under
    /// `peer_<peer_id>/<file_name>`.
    ///
    /// If `starts_with_file` is true the store is initialized as already
    /// complete; if the file happens to be missing on disk in that case
    /// (a misconfigured seed) a zero-filled placeholder is created instead
    /// of failing outright, and a warning is logged.
    pub fn new(
        peer_id: PeerId,
        file_name: &str,
        file_size: u64,
        piece_size: u32,
        starts_with_file: bool,
    ) -> Result<Self> {
        let dir = PathBuf::from(format!("peer_{}", peer_id));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);

        if starts_with_file && !path.exists() {
            log::warn!(
                "peer {} is configured to start with the file but {:?} is missing; \
                 creating a zero-filled placeholder",
                peer_id,
                path
            );
        }
        if !path.exists() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(file_size)?;
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let num_pieces = piece_count(file_size, piece_size);
        let mut bitfield = Bitfield::new(num_pieces);
        let mut num_have = 0;
        if starts_with_file {
            bitfield.set_all();
            num_have = num_pieces;
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                bitfield,
                num_have,
            }),
            file_size,
            piece_size,
            num_pieces,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index >= self.num_pieces {
            return Err(Error::Protocol(format!("piece index {} out of range", index)));
        }
        Ok(piece_len(self.file_size, self.piece_size, index))
    }

    /// Writes a complete piece to disk and records it in the local
    /// bitfield. Fails if `data`'s length doesn't match the expected piece
    /// length.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        let expected_len = self.piece_len(index)?;
        if data.len() != expected_len as usize {
            return Err(Error::Protocol(format!(
                "piece {} has length {}, expected {}",
                index,
                data.len(),
                expected_len
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let offset = index as u64 * self.piece_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        if !inner.bitfield.has(index)? {
            inner.bitfield.set(index)?;
            inner.num_have += 1;
        }
        Ok(())
    }

    /// Reads a complete piece from disk. Fails if we don't have it yet.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let expected_len = self.piece_len(index)?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.bitfield.has(index)? {
            return Err(Error::Protocol(format!("piece {} not present locally", index)));
        }
        let offset = index as u64 * self.piece_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; expected_len as usize];
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Returns true once every piece has been written.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.num_have == self.num_pieces
    }

    /// Returns a clone of the current bitfield, safe to hand off across an
    /// await point or send over a channel.
    pub fn bitfield_snapshot(&self) -> Bitfield {
        self.inner.lock().unwrap().bitfield.clone()
    }

    /// Returns true if `their_bitfield` advertises at least one piece we
    /// don't have yet.
    pub fn check_interest(&self, their_bitfield: &Bitfield) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bitfield.has_any_interesting(their_bitfield)
    }
}
