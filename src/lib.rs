//! Resilient real-time RTP transport core.
//!
//! Carries RTP-framed media over lossy UDP while tolerating ~20% packet
//! loss: forward error correction and redundant encoding recover missing
//! packets, a jitter-tolerant playback buffer absorbs reordering and
//! arrival jitter, and an adaptive controller keeps bitrate and protection
//! level matched to current network conditions.
//!
//! The three subsystems ([`fec`], [`jitter`], [`controller`]) are wired
//! together by [`engine`], which is the only part of this crate that
//! touches a socket.

pub mod config;
pub mod controller;
pub mod engine;
pub mod fec;
pub mod field;
pub mod jitter;
pub mod rtcp;
pub mod rtp;

pub use config::Config;
pub use controller::AdaptiveController;
pub use engine::Engine;
pub use fec::FecEngine;
pub use jitter::PlaybackBuffer;
pub use rtp::{Packet, RtpError};
