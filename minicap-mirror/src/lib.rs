//! # minicap-mirror
//!
//! Command-line screen mirror for a single adb-attached device.
//!
//! Starts the capture helper through adb, decodes its stream and keeps
//! the most recent frame on disk so any image viewer can follow along.
//!
//! - **config**: `MirrorConfig`, loaded from TOML with CLI overrides.
//! - **sink**: `FrameWriter`, the file-writing frame sink.

pub mod config;
pub mod sink;
