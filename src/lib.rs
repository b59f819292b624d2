//! On-device pairing, secure channel, session recording, and capture
//! pipeline for a mobile-to-desktop room-scanning data plane.
//!
//! This crate is the core data plane only: the sensor/frame source, the
//! UI layer, LAN discovery's mDNS/Bonjour browser, and the desktop peer
//! are all external collaborators expressed here as named interfaces
//! (`capture::FrameSource`, `discovery::parse_txt_record`) rather than
//! implementations.

pub mod capture;
pub mod config;
pub mod controller;
pub mod crypto_primitives;
pub mod discovery;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod pairing;
pub mod recorder;
pub mod secure_channel;
pub mod sequencer;
pub mod tls_pinning;
pub mod transport;
pub mod trust;

pub use error::{ScanError, ScanResult};
