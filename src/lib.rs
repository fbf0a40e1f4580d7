#![forbid(unsafe_code)]

//! vidrelay: paste a video URL, get its metadata and a downloadable file.
//!
//! The crate is organised leaf to root: [`identifier`] validates input,
//! [`capability`] and [`provision`] find a working acquisition backend,
//! [`metadata`] describes the video, [`orchestrator`] runs the download
//! fallback chain, [`storage`] manages the scratch directory, and
//! [`pipeline`] plus [`server`] tie it together for the binaries.

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod identifier;
pub mod metadata;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod security;
pub mod server;
pub mod storage;
