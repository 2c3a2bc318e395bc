//! # Torrent Descriptor and Download Coordination
//!
//! Parses the bencoded `.torrent` metadata, performs the single tracker
//! announce that yields the peer list, and coordinates the download itself.
//!
//! ## Torrent File Format
//!
//! A `.torrent` file is a bencoded dictionary:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: dictionary describing the file
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!   - **piece length**: size of each piece (except possibly the last)
//!   - **length**: total file size
//!   - **name**: suggested filename
//!
//! The info hash identifying the torrent is the SHA-1 of the bencoded
//! **info** dictionary.
//!
//! ## Download Coordination
//!
//! The coordinator seeds the shared work queue with one unit per piece,
//! spawns a worker thread per peer, then collects verified pieces from the
//! result channel and writes each into its slot of the output buffer.
//! Pieces arrive in arbitrary order; slots are disjoint, so order does not
//! matter. When the last piece lands the queue is closed, which releases
//! every worker still blocked on it. If instead every worker dies first,
//! the download fails; no partial output is ever produced.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use crate::peer::{self, Peer};
use crate::queue::{PieceQueue, PieceResult, PieceWork};
use crate::worker::Worker;

// Port reported to the tracker
const PORT: u16 = 6881;

// Size of a SHA-1 digest in bytes
const SHA1_HASH_SIZE: usize = 20;

// Upper bound on concurrent peer sessions; together with the per-session
// request backlog this caps the total number of in-flight block requests
const MAX_PEERS: usize = 30;

/// A parsed torrent plus everything needed to download it.
pub struct Torrent {
    /// Tracker URL
    announce: String,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 digest per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from the torrent metadata
    name: String,
    /// 20-byte identifier for this client instance
    peer_id: Vec<u8>,
    /// Peers discovered through the tracker
    peers: Vec<Peer>,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces' 20-byte SHA-1 digests
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    announce: String,
    // Information about the file
    info: BencodeInfo,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Seconds to wait before refreshing the peer list
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to uniquely identify the torrent.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash = hasher.finish().to_vec();

        Ok(hash)
    }

    /// Split the concatenated piece digests into one hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let pieces = self.pieces.to_owned();

        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has a malformed pieces field"));
        }

        let hashes = pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();

        Ok(hashes)
    }
}

impl Torrent {
    /// Open a torrent file and discover its peers.
    pub fn open(filepath: PathBuf) -> Result<Torrent> {
        // Open torrent
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        // Read torrent content in a buffer
        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        // Deserialize bencoded data from torrent
        let bencode = match de::from_bytes::<BencodeTorrent>(&buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        if bencode.announce.is_empty() {
            return Err(anyhow!("torrent has no announce URL"));
        }

        let mut torrent = Torrent {
            announce: bencode.announce.to_owned(),
            info_hash: bencode.info.hash()?,
            pieces_hashes: bencode.info.split_pieces_hashes()?,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name.to_owned(),
            peer_id: generate_peer_id(),
            peers: vec![],
        };
        torrent.peers = torrent.request_peers(PORT)?;

        Ok(torrent)
    }

    /// Announce to the tracker and collect the peers it answers with.
    fn request_peers(&self, port: u16) -> Result<Vec<Peer>> {
        let tracker_url = build_tracker_url(
            &self.info_hash,
            &self.announce,
            &self.peer_id,
            port,
            self.length,
        )?;

        // Build blocking HTTP client
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err(anyhow!("could not build tracker client")),
        };

        // Send GET request to the tracker
        let response = match client.get(&tracker_url).send() {
            Ok(response) => match response.bytes() {
                Ok(bytes) => bytes,
                Err(_) => return Err(anyhow!("could not read tracker response")),
            },
            Err(_) => return Err(anyhow!("could not reach tracker")),
        };

        // Deserialize bencoded tracker response
        let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode tracker response")),
        };

        // Decode the compact peer list, dropping duplicates
        let mut seen = HashSet::new();
        let peers: Vec<Peer> = peer::from_compact(&tracker_bencode.peers)?
            .into_iter()
            .filter(|peer| seen.insert((peer.ip, peer.port)))
            .collect();

        if peers.is_empty() {
            return Err(anyhow!("tracker returned no peers"));
        }

        info!("Tracker returned {} peers", peers.len());

        Ok(peers)
    }

    /// Download the torrent into a single verified buffer.
    pub fn download(&self) -> Result<Vec<u8>> {
        let total_pieces = self.pieces_hashes.len();
        println!("Downloading {:?} ({} pieces)", self.name, total_pieces);

        // Seed the shared work queue with one unit per piece
        let queue = Arc::new(PieceQueue::new());
        let mut pieces = Vec::with_capacity(total_pieces);
        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let index = index as u32;
            pieces.push(PieceWork::new(index, hash.clone(), self.piece_length(index)));
        }
        queue.seed(pieces);

        // Spawn one worker per peer, up to the session cap
        let (result_sender, result_receiver) = unbounded();
        for peer in self.peers.iter().take(MAX_PEERS) {
            let worker = Worker::new(
                peer.clone(),
                self.peer_id.clone(),
                self.info_hash.clone(),
                Arc::clone(&queue),
                result_sender.clone(),
            );

            thread::spawn(move || worker.run());
        }

        // Only workers hold senders now; if they all die, the receive below
        // disconnects instead of blocking forever.
        drop(result_sender);

        // Create progress bar
        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Assemble verified pieces into the output buffer
        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut completed = vec![false; total_pieces];
        let mut nb_completed = 0;
        while nb_completed < total_pieces {
            let piece_result: PieceResult = match result_receiver.recv() {
                Ok(piece_result) => piece_result,
                Err(_) => {
                    queue.close();
                    return Err(anyhow!(
                        "every peer connection failed before the download completed"
                    ));
                }
            };

            // A piece can be delivered twice if two sessions raced it; only
            // the first result counts
            let index = piece_result.index as usize;
            if completed[index] {
                debug!("Discarding duplicate result for piece {}", piece_result.index);
                continue;
            }

            // Copy piece data into its slot
            let begin = self.piece_offset(piece_result.index) as usize;
            data[begin..begin + piece_result.data.len()].copy_from_slice(&piece_result.data);
            completed[index] = true;
            nb_completed += 1;

            // Update progress bar
            pb.inc(piece_result.data.len() as u64);
        }

        // Release workers still blocked on the queue
        queue.close();

        Ok(data)
    }

    /// Length of a piece; the final piece is truncated to the file length.
    fn piece_length(&self, index: u32) -> u32 {
        let begin = index * self.piece_length;
        let mut end = begin + self.piece_length;

        if end > self.length {
            end = self.length;
        }

        end - begin
    }

    /// Byte offset of a piece within the file.
    fn piece_offset(&self, index: u32) -> u32 {
        index * self.piece_length
    }
}

/// Generate a random 20-byte peer id for this client instance.
fn generate_peer_id() -> Vec<u8> {
    let mut peer_id: Vec<u8> = vec![0; 20];
    let mut rng = rand::thread_rng();
    for x in peer_id.iter_mut() {
        *x = rng.gen();
    }
    peer_id
}

/// Build the announce URL with the binary fields percent-encoded by hand.
fn build_tracker_url(
    info_hash: &[u8],
    announce: &str,
    peer_id: &[u8],
    port: u16,
    length: u32,
) -> Result<String> {
    /// Each byte is encoded as %XX where XX is its hexadecimal value
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    // Parse tracker URL from torrent
    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    // Build query string manually to keep the binary fields intact
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        length
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Handshake;
    use crate::message::Message;
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpListener, TcpStream};

    const TEST_PIECE_LENGTH: u32 = 16;

    fn sha1(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish().to_vec()
    }

    fn make_torrent(source: &[u8], info_hash: Vec<u8>, peers: Vec<Peer>) -> Torrent {
        Torrent {
            announce: String::new(),
            info_hash,
            pieces_hashes: source
                .chunks(TEST_PIECE_LENGTH as usize)
                .map(sha1)
                .collect(),
            piece_length: TEST_PIECE_LENGTH,
            length: source.len() as u32,
            name: "scenario".to_string(),
            peer_id: b"-SK0001-abcdefghijkl".to_vec(),
            peers,
        }
    }

    #[derive(Default)]
    struct MockBehavior {
        /// Serve flipped bytes for this piece index
        corrupt_piece: Option<u32>,
        /// Open with a have message instead of the bitfield
        skip_bitfield: bool,
    }

    fn read_frame(conn: &mut TcpStream) -> Option<Message> {
        let mut len_buf = [0; 4];
        conn.read_exact(&mut len_buf).ok()?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Some(Message::KeepAlive);
        }
        let mut body = vec![0; len];
        conn.read_exact(&mut body).ok()?;
        Message::parse(&body).ok()
    }

    fn write_frame(conn: &mut TcpStream, message: &Message) {
        let _ = conn.write_all(&message.serialize());
    }

    /// Serve `source` over a loopback listener the way a remote peer would.
    fn spawn_mock_peer(source: Vec<u8>, info_hash: Vec<u8>, behavior: MockBehavior) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut conn, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };

            // Handshake
            let theirs = match Handshake::read(&mut conn) {
                Ok(theirs) => theirs,
                Err(_) => return,
            };
            assert_eq!(theirs.info_hash, info_hash);
            let reply = Handshake::new(info_hash, b"-SKMOCK-000000000000".to_vec());
            let _ = conn.write_all(&reply.serialize());

            if behavior.skip_bitfield {
                write_frame(&mut conn, &Message::Have(0));
                return;
            }

            // Advertise every piece
            let nb_pieces = source.len().div_ceil(TEST_PIECE_LENGTH as usize);
            let mut bits = vec![0u8; nb_pieces.div_ceil(8)];
            for index in 0..nb_pieces {
                bits[index / 8] |= 1 << (7 - index % 8);
            }
            write_frame(&mut conn, &Message::Bitfield(bits));

            // Serve requests until the downloader hangs up
            while let Some(message) = read_frame(&mut conn) {
                match message {
                    Message::Interested => write_frame(&mut conn, &Message::Unchoke),
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => {
                        let offset = (index * TEST_PIECE_LENGTH + begin) as usize;
                        let mut block = source[offset..offset + length as usize].to_vec();
                        if behavior.corrupt_piece == Some(index) {
                            for byte in &mut block {
                                *byte = !*byte;
                            }
                        }
                        write_frame(&mut conn, &Message::Piece {
                            index,
                            begin,
                            block,
                        });
                    }
                    _ => {}
                }
            }
        });

        Peer {
            ip: Ipv4Addr::new(127, 0, 0, 1),
            port,
        }
    }

    #[test]
    fn final_piece_is_truncated_to_the_file_length() {
        let source = vec![7u8; 50];
        let torrent = make_torrent(&source, vec![0x42; 20], vec![]);

        assert_eq!(torrent.pieces_hashes.len(), 4);
        assert_eq!(torrent.piece_length(0), 16);
        assert_eq!(torrent.piece_length(3), 2);
        assert_eq!(torrent.piece_offset(3), 48);
    }

    #[test]
    fn build_tracker_url_percent_encodes_binary_fields() {
        let url = build_tracker_url(
            &[0x12, 0xAB, 0xFF],
            "http://tracker.example.com:6969/announce",
            &[0x01, 0x02],
            6881,
            1024,
        )
        .unwrap();

        assert!(url.starts_with("http://tracker.example.com:6969/announce?"));
        assert!(url.contains("info_hash=%12%AB%FF"));
        assert!(url.contains("peer_id=%01%02"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("left=1024"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn download_from_two_full_seeders_reassembles_the_source() {
        let source: Vec<u8> = (0..64u8).collect();
        let info_hash = vec![0x42; 20];
        let peers = vec![
            spawn_mock_peer(source.clone(), info_hash.clone(), MockBehavior::default()),
            spawn_mock_peer(source.clone(), info_hash.clone(), MockBehavior::default()),
        ];

        let torrent = make_torrent(&source, info_hash, peers);
        let data = torrent.download().unwrap();

        assert_eq!(data, source);
        for (index, hash) in torrent.pieces_hashes.iter().enumerate() {
            let begin = index * TEST_PIECE_LENGTH as usize;
            let end = (begin + TEST_PIECE_LENGTH as usize).min(data.len());
            assert_eq!(&sha1(&data[begin..end]), hash);
        }
    }

    #[test]
    fn corrupted_piece_is_retried_on_another_peer() {
        let source: Vec<u8> = (0..64u8).rev().collect();
        let info_hash = vec![0x43; 20];
        let peers = vec![
            spawn_mock_peer(
                source.clone(),
                info_hash.clone(),
                MockBehavior {
                    corrupt_piece: Some(2),
                    ..Default::default()
                },
            ),
            spawn_mock_peer(source.clone(), info_hash.clone(), MockBehavior::default()),
        ];

        let torrent = make_torrent(&source, info_hash, peers);
        let data = torrent.download().unwrap();

        assert_eq!(data, source);
    }

    #[test]
    fn peer_opening_without_a_bitfield_does_not_stall_the_download() {
        let source: Vec<u8> = (100..164u8).collect();
        let info_hash = vec![0x44; 20];
        let peers = vec![
            spawn_mock_peer(
                source.clone(),
                info_hash.clone(),
                MockBehavior {
                    skip_bitfield: true,
                    ..Default::default()
                },
            ),
            spawn_mock_peer(source.clone(), info_hash.clone(), MockBehavior::default()),
        ];

        let torrent = make_torrent(&source, info_hash, peers);
        let data = torrent.download().unwrap();

        assert_eq!(data, source);
    }
}
