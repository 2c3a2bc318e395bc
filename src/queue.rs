//! # Piece Work Queue
//!
//! Shared supply of pending piece downloads, pulled from concurrently by
//! every worker.
//!
//! The queue is seeded once with one [`PieceWork`] per piece and then only
//! shrinks as pieces are delivered. A worker that fails an attempt puts the
//! unit back, so no piece is ever lost to a dead connection. Order is the
//! seed order, perturbed by requeues landing at the back.
//!
//! When the coordinator has accepted every piece it closes the queue, which
//! wakes all blocked [`PieceQueue::dequeue`] callers with `None` so workers
//! can exit.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Descriptor of one piece to download. Immutable; per-attempt progress is
/// kept by the worker making the attempt.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// SHA-1 digest the assembled piece must match (20 bytes)
    pub hash: Vec<u8>,
    /// Length of the piece in bytes
    pub length: u32,
}

/// A fully downloaded, hash-verified piece on its way to the coordinator.
#[derive(Debug)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// The verified piece data, exactly the piece length
    pub data: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

/// Concurrency-safe FIFO of pending piece downloads with an explicit close.
pub struct PieceQueue {
    sender: Mutex<Option<Sender<PieceWork>>>,
    receiver: Receiver<PieceWork>,
}

impl PieceQueue {
    /// Create an empty, open queue.
    pub fn new() -> PieceQueue {
        let (sender, receiver) = unbounded();
        PieceQueue {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Load the queue with every piece of the download. Called once, before
    /// any worker starts pulling.
    pub fn seed(&self, pieces: Vec<PieceWork>) {
        let guard = self.sender.lock().unwrap();
        if let Some(sender) = guard.as_ref() {
            for piece in pieces {
                // Receiver lives on self, so the send cannot fail.
                let _ = sender.send(piece);
            }
        }
    }

    /// Pull the next piece to work on, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been closed and drained.
    pub fn dequeue(&self) -> Option<PieceWork> {
        self.receiver.recv().ok()
    }

    /// Put a piece back after a failed attempt so another session can
    /// retry it.
    pub fn requeue(&self, piece: PieceWork) {
        let guard = self.sender.lock().unwrap();
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(piece);
        }
    }

    /// Close the queue. Invoked exactly once by the coordinator when every
    /// piece has been delivered; all blocked and future dequeues observe the
    /// end of the queue.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}
