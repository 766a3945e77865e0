//! Decides which piece a peer should download next.
//!
//! The picker tracks which pieces are still needed and how many of the
//! connected peers advertise each of them. Selection prefers resuming
//! a suspended partial download, and otherwise picks the rarest needed piece
//! the peer has, so that poorly seeded pieces don't become unavailable when
//! peers leave the swarm.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use sha1::Sha1;

use crate::{Bitfield, PieceIndex};

/// A piece download that was interrupted partway through, waiting to be
/// picked up by another peer.
///
/// The running hash covers exactly the first `bytes_received` bytes of the
/// piece, which are already on disk, so the download continues where it left
/// off without rereading or rehashing anything.
#[derive(Debug)]
pub(crate) struct PartialPiece {
    /// The index of the interrupted piece.
    pub piece_index: PieceIndex,
    /// How many bytes of the piece were received before the interruption.
    pub bytes_received: u32,
    /// The SHA-1 of the received bytes, mid-digest.
    pub hasher: Sha1,
}

/// The result of a pick: either a suspended download to resume or a piece
/// not downloaded before.
#[derive(Debug)]
pub(crate) enum Pick {
    Resumed(PartialPiece),
    Fresh(PieceIndex),
}

/// Availability and selection bookkeeping for all pieces the torrent still
/// needs.
pub(crate) struct PiecePicker {
    /// Maps each needed piece to the peers that advertise it. A piece's
    /// occurrence count is the size of its peer set. Entries are removed
    /// exactly when the downloaded piece passes its hash check, so the keys
    /// are at all times the complement of the torrent's have set.
    needed: HashMap<PieceIndex, HashSet<SocketAddr>>,
    /// The suspended partial downloads, oldest first. No piece appears here
    /// twice, nor while it is reserved by any peer.
    partial: Vec<PartialPiece>,
}

impl PiecePicker {
    /// Creates a piece picker that considers every piece needed, as resuming
    /// a download from disk is not supported.
    pub fn new(piece_count: usize) -> Self {
        Self {
            needed: (0..piece_count).map(|i| (i, HashSet::new())).collect(),
            partial: Vec::new(),
        }
    }

    /// Registers that the peer advertises all pieces set in the bitfield.
    pub fn register_availability(
        &mut self,
        addr: SocketAddr,
        pieces: &Bitfield,
    ) {
        for (index, has_piece) in pieces.iter().enumerate() {
            if *has_piece {
                if let Some(peers) = self.needed.get_mut(&index) {
                    peers.insert(addr);
                }
            }
        }
    }

    /// Registers that the peer announced a single new piece. Returns whether
    /// the piece is still needed.
    pub fn register_have(
        &mut self,
        addr: SocketAddr,
        index: PieceIndex,
    ) -> bool {
        match self.needed.get_mut(&index) {
            Some(peers) => {
                peers.insert(addr);
                true
            }
            None => false,
        }
    }

    /// Removes a disconnected peer from the availability counts of all the
    /// pieces it advertised.
    pub fn unregister_peer(&mut self, addr: SocketAddr, pieces: &Bitfield) {
        for (index, has_piece) in pieces.iter().enumerate() {
            if *has_piece {
                if let Some(peers) = self.needed.get_mut(&index) {
                    peers.remove(&addr);
                }
            }
        }
    }

    /// Picks a piece for a peer with the given advertised pieces to download.
    ///
    /// `reserved` must hold the pieces currently reserved by other peers;
    /// those are never picked. Within the remaining candidates a suspended
    /// partial download takes precedence, in suspension order; otherwise the
    /// piece advertised by the fewest peers wins, ties broken by the lower
    /// index.
    pub fn pick(
        &mut self,
        peer_pieces: &Bitfield,
        reserved: &HashSet<PieceIndex>,
    ) -> Option<Pick> {
        debug_assert!(self
            .partial
            .iter()
            .all(|p| !reserved.contains(&p.piece_index)));

        if let Some(pos) = self
            .partial
            .iter()
            .position(|p| peer_pieces[p.piece_index])
        {
            return Some(Pick::Resumed(self.partial.remove(pos)));
        }

        self.needed
            .iter()
            .filter(|(index, peers)| {
                peer_pieces[**index]
                    && !peers.is_empty()
                    && !reserved.contains(index)
            })
            .min_by_key(|(index, peers)| (peers.len(), **index))
            .map(|(index, _)| Pick::Fresh(*index))
    }

    /// Puts an interrupted download aside to be resumed by another (or the
    /// same) peer later.
    pub fn suspend(&mut self, partial: PartialPiece) {
        debug_assert!(self.needed.contains_key(&partial.piece_index));
        debug_assert!(!self
            .partial
            .iter()
            .any(|p| p.piece_index == partial.piece_index));
        self.partial.push(partial);
    }

    /// Marks the piece as no longer needed, after it was downloaded and
    /// passed its hash check.
    pub fn received_piece(&mut self, index: PieceIndex) {
        self.needed.remove(&index);
    }

    /// Returns whether the piece is still needed.
    pub fn contains(&self, index: PieceIndex) -> bool {
        self.needed.contains_key(&index)
    }

    /// Returns how many peers advertise the piece, or `None` if the piece is
    /// not needed anymore.
    pub fn frequency(&self, index: PieceIndex) -> Option<usize> {
        self.needed.get(&index).map(|peers| peers.len())
    }

    /// The number of pieces still needed.
    pub fn missing_count(&self) -> usize {
        self.needed.len()
    }

    /// Returns true once no piece is needed anymore.
    pub fn is_complete(&self) -> bool {
        self.needed.is_empty()
    }

    /// The currently suspended partial downloads, in suspension order.
    #[cfg(test)]
    pub fn partials(&self) -> &[PartialPiece] {
        &self.partial
    }
}

#[cfg(test)]
mod tests {
    use bitvec::prelude::*;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn pieces_of(indices: &[PieceIndex], piece_count: usize) -> Bitfield {
        let mut pieces = bitvec![Msb0, u8; 0; piece_count];
        for index in indices {
            pieces.set(*index, true);
        }
        pieces
    }

    // With peer a advertising pieces {0, 1} and peer b pieces {1, 2}, the
    // occurrence counts are 0 -> 1, 1 -> 2, 2 -> 1, so a must be assigned
    // piece 0 and b piece 2.
    #[test]
    fn test_rarest_first_with_ascending_index_tie_break() {
        let (a, b) = (addr(1), addr(2));
        let a_pieces = pieces_of(&[0, 1], 3);
        let b_pieces = pieces_of(&[1, 2], 3);

        let mut picker = PiecePicker::new(3);
        picker.register_availability(a, &a_pieces);
        picker.register_availability(b, &b_pieces);
        assert_eq!(picker.frequency(0), Some(1));
        assert_eq!(picker.frequency(1), Some(2));
        assert_eq!(picker.frequency(2), Some(1));

        let mut reserved = HashSet::new();
        match picker.pick(&a_pieces, &reserved) {
            Some(Pick::Fresh(0)) => (),
            pick => panic!("expected piece 0 for peer a, got {:?}", pick),
        }
        reserved.insert(0);
        match picker.pick(&b_pieces, &reserved) {
            Some(Pick::Fresh(2)) => (),
            pick => panic!("expected piece 2 for peer b, got {:?}", pick),
        }
    }

    #[test]
    fn test_partial_is_preferred_over_rarest() {
        let a = addr(1);
        let all = pieces_of(&[0, 1, 2], 3);
        let mut picker = PiecePicker::new(3);
        picker.register_availability(a, &all);

        // piece 2 was interrupted partway through, so even though all pieces
        // are equally rare and piece 0 has the lower index, 2 wins
        picker.suspend(PartialPiece {
            piece_index: 2,
            bytes_received: 0x4000,
            hasher: Sha1::default(),
        });
        match picker.pick(&all, &HashSet::new()) {
            Some(Pick::Resumed(partial)) => {
                assert_eq!(partial.piece_index, 2);
                assert_eq!(partial.bytes_received, 0x4000);
            }
            pick => panic!("expected to resume piece 2, got {:?}", pick),
        }
        assert!(picker.partials().is_empty());

        // the piece is claimed, so the next pick falls back to rarest first
        match picker.pick(&all, &HashSet::new()) {
            Some(Pick::Fresh(0)) => (),
            pick => panic!("expected piece 0, got {:?}", pick),
        }
    }

    #[test]
    fn test_partial_not_advertised_by_peer_is_skipped() {
        let a = addr(1);
        let a_pieces = pieces_of(&[1], 2);
        let mut picker = PiecePicker::new(2);
        picker.register_availability(a, &a_pieces);

        picker.suspend(PartialPiece {
            piece_index: 0,
            bytes_received: 123,
            hasher: Sha1::default(),
        });
        // the peer doesn't have the partial piece, so it gets a fresh one and
        // the partial list is untouched
        match picker.pick(&a_pieces, &HashSet::new()) {
            Some(Pick::Fresh(1)) => (),
            pick => panic!("expected piece 1, got {:?}", pick),
        }
        assert_eq!(picker.partials().len(), 1);
    }

    #[test]
    fn test_reserved_pieces_are_not_picked() {
        let a = addr(1);
        let a_pieces = pieces_of(&[0, 1], 2);
        let mut picker = PiecePicker::new(2);
        picker.register_availability(a, &a_pieces);

        let mut reserved = HashSet::new();
        reserved.insert(0);
        match picker.pick(&a_pieces, &reserved) {
            Some(Pick::Fresh(1)) => (),
            pick => panic!("expected piece 1, got {:?}", pick),
        }
        reserved.insert(1);
        assert!(picker.pick(&a_pieces, &reserved).is_none());
    }

    #[test]
    fn test_availability_bookkeeping() {
        let (a, b) = (addr(1), addr(2));
        let pieces = pieces_of(&[0, 1], 2);
        let mut picker = PiecePicker::new(2);

        picker.register_availability(a, &pieces);
        picker.register_availability(b, &pieces);
        // registering the same peer twice doesn't double count
        picker.register_availability(a, &pieces);
        assert_eq!(picker.frequency(0), Some(2));

        assert!(picker.register_have(a, 1));
        assert_eq!(picker.frequency(1), Some(2));

        picker.unregister_peer(b, &pieces);
        assert_eq!(picker.frequency(0), Some(1));
        assert_eq!(picker.frequency(1), Some(1));

        // nothing is picked for a peer with no pieces
        assert!(picker
            .pick(&pieces_of(&[], 2), &HashSet::new())
            .is_none());
    }

    #[test]
    fn test_received_piece_is_never_picked_again() {
        let a = addr(1);
        let pieces = pieces_of(&[0, 1], 2);
        let mut picker = PiecePicker::new(2);
        picker.register_availability(a, &pieces);

        picker.received_piece(0);
        assert!(!picker.contains(0));
        assert!(!picker.register_have(a, 0));
        assert_eq!(picker.missing_count(), 1);
        match picker.pick(&pieces, &HashSet::new()) {
            Some(Pick::Fresh(1)) => (),
            pick => panic!("expected piece 1, got {:?}", pick),
        }
        assert!(!picker.is_complete());
        picker.received_piece(1);
        assert!(picker.is_complete());
    }
}
