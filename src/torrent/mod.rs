//! Torrent handling module
//!
//! Magnet link parsing and `.torrent` file assembly.

pub mod builder;
pub mod magnet;

pub use builder::{torrent_file_name, TorrentBuilder};
pub use magnet::{MagnetInfo, MagnetParser};
