//! Tracker client module
//!
//! Clients for HTTP/HTTPS trackers and UDP (BEP 15) trackers.

pub mod http;
pub mod udp;

pub use http::HttpTrackerClient;
pub use udp::UdpTrackerClient;
