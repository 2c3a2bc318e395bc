//! # Skiff
//!
//! A command-line BitTorrent downloader written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Multi-peer concurrent downloading with pipelined block requests
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! skiff <torrent_file> <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, assembles
//!   verified pieces into the output buffer
//! - **Worker threads**: one per peer, each driving a single connection
//! - **Shared queue**: distributes piece work across workers and takes
//!   failed attempts back for retry

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod error;
mod handshake;
mod message;
mod peer;
mod queue;
mod torrent;
mod worker;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;

use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(version, about = "A multi-peer BitTorrent downloader, written in Rust.")]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Path where the downloaded file is written
    output: String,
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    // Parse torrent and discover peers
    let torrent = Torrent::open(PathBuf::from(&args.torrent))?;

    // Download torrent
    let data: Vec<u8> = torrent.download()?;

    // The output file is only created once the whole download has verified,
    // so a failed run leaves no partial artifact behind
    if let Err(e) = fs::write(&args.output, &data) {
        return Err(anyhow!(
            "could not write data to file '{}': {}",
            args.output,
            e
        ));
    }

    println!("Saved in {:?}.", args.output);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
