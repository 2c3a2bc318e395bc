//! # Peer Session Worker
//!
//! One worker per peer endpoint, each on its own thread. A worker brings up
//! its connection, then pulls pieces from the shared queue until the queue
//! closes or the connection dies.
//!
//! ## Download Process
//!
//! 1. **Connect**: dial, handshake and read the bitfield, each with a short
//!    bounded timeout; any failure drops the peer for good
//! 2. **Pull work**: skip (requeue) pieces the peer does not claim to have
//! 3. **Pipelined transfer**: keep up to five block requests in flight while
//!    unchoked, 16 KiB per block, last block truncated to the piece
//! 4. **Verification**: SHA-1 the assembled piece against the torrent's
//!    declared digest
//! 5. **Delivery**: hand the verified piece to the coordinator
//!
//! ## Failure Handling
//!
//! Every failure path puts the piece back on the queue first. Connection and
//! protocol errors end the session; a failed hash check only ends it after
//! [`MAX_INTEGRITY_FAILURES`] corrupted pieces from the same peer.

use std::sync::Arc;

use boring::sha::Sha1;
use crossbeam_channel::Sender;

use crate::client::Client;
use crate::error::PeerError;
use crate::message::{self, Message};
use crate::peer::Peer;
use crate::queue::{PieceQueue, PieceResult, PieceWork};

// Maximum number of block requests in flight per peer
const MAX_BACKLOG: u32 = 5;

// Block size requested from peers (16 KiB)
const BLOCK_SIZE: u32 = 16384;

// Timeout for each read once the session is in its steady state
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

// Corrupted pieces tolerated from one peer before disconnecting it
const MAX_INTEGRITY_FAILURES: u32 = 3;

/// Downloads pieces from a single peer until the work runs out.
pub struct Worker {
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Shared supply of pieces still to download
    queue: Arc<PieceQueue>,
    /// Channel delivering verified pieces to the coordinator
    results: Sender<PieceResult>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        queue: Arc<PieceQueue>,
        results: Sender<PieceResult>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            queue,
            results,
        }
    }

    /// Run the session to completion. Errors never escape; they end the
    /// session and the remaining peers carry on.
    pub fn run(self) {
        let mut client = match Client::connect(&self.peer, &self.peer_id, &self.info_hash) {
            Ok(client) => client,
            Err(e) => {
                debug!("Peer {} unusable: {}", self.peer, e);
                return;
            }
        };

        if client.send_unchoke().is_err() || client.send_interested().is_err() {
            return;
        }
        if client.set_connection_timeout(DOWNLOAD_TIMEOUT_SECS).is_err() {
            return;
        }

        let mut integrity_failures: u32 = 0;

        while let Some(piece_work) = self.queue.dequeue() {
            // Skip pieces this peer does not have; another session will
            if !client.has_piece(piece_work.index) {
                self.queue.requeue(piece_work);
                continue;
            }

            // Download piece
            let data = match self.download_piece(&mut client, &piece_work) {
                Ok(data) => data,
                Err(e) => {
                    debug!(
                        "Piece {} from peer {} failed: {}",
                        piece_work.index, self.peer, e
                    );
                    self.queue.requeue(piece_work);
                    return;
                }
            };

            // Verify piece integrity
            if let Err(e) = verify_piece(&piece_work, &data) {
                warn!("Peer {}: {}", self.peer, e);
                self.queue.requeue(piece_work);

                integrity_failures += 1;
                if integrity_failures >= MAX_INTEGRITY_FAILURES {
                    warn!(
                        "Dropping peer {} after {} corrupted pieces",
                        self.peer, integrity_failures
                    );
                    return;
                }
                continue;
            }

            // Notify peer that the piece was downloaded
            if let Err(e) = client.send_have(piece_work.index) {
                debug!("Could not send have to peer {}: {}", self.peer, e);
            }

            // Deliver the verified piece
            let result = PieceResult::new(piece_work.index, data);
            if self.results.send(result).is_err() {
                // Coordinator has finished or aborted; nothing left to do.
                return;
            }
        }

        debug!("Peer {}: work queue closed, exiting", self.peer);
    }

    /// Download one piece over an established connection.
    ///
    /// Requests are pipelined: while unchoked, up to [`MAX_BACKLOG`] block
    /// requests stay in flight. Incoming messages are consumed until every
    /// byte of the piece has arrived. Choke state, have notifications and
    /// keep-alives are handled in place; other messages are ignored.
    fn download_piece(
        &self,
        client: &mut Client,
        piece_work: &PieceWork,
    ) -> Result<Vec<u8>, PeerError> {
        let mut buf = vec![0; piece_work.length as usize];
        let mut downloaded: u32 = 0;
        let mut requested: u32 = 0;
        let mut backlog: u32 = 0;

        while downloaded < piece_work.length {
            if !client.is_choked() {
                while backlog < MAX_BACKLOG && requested < piece_work.length {
                    // Last block is truncated to the remaining piece length
                    let block_size = BLOCK_SIZE.min(piece_work.length - requested);

                    client.send_request(piece_work.index, requested, block_size)?;

                    backlog += 1;
                    requested += block_size;
                }
            }

            match client.read_message()? {
                Message::Choke => client.mark_choked(),
                Message::Unchoke => client.mark_unchoked(),
                Message::Have(index) => client.set_piece(index),
                piece @ Message::Piece { .. } => {
                    let n = message::parse_piece(piece_work.index, &mut buf, &piece)?;
                    downloaded += n as u32;
                    backlog = backlog.saturating_sub(1);
                }
                Message::KeepAlive => {}
                other => {
                    debug!(
                        "Ignoring {} message from peer {}",
                        other.kind(),
                        client.peer()
                    );
                }
            }
        }

        debug!(
            "Downloaded piece {} from peer {}",
            piece_work.index, self.peer
        );

        Ok(buf)
    }
}

/// Check a downloaded piece against its declared SHA-1 digest.
fn verify_piece(piece_work: &PieceWork, data: &[u8]) -> Result<(), PeerError> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash = hasher.finish().to_vec();

    if hash != piece_work.hash {
        return Err(PeerError::Integrity(piece_work.index));
    }

    Ok(())
}
