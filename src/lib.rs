#![forbid(unsafe_code)]

//! Public entry point for the reusable GrabTube Rust crate.
//!
//! The crate is intentionally small; it exposes the format-selection policy,
//! the delivery strategies, and the yt-dlp capability providers so binaries
//! can share struct definitions and invocation helpers.

pub mod config;
pub mod delivery;
pub mod error;
pub mod formats;
pub mod youtube;
pub mod ytdlp;
