//! Protocol module for host directives and outbound framing.
//!
//! This module contains the implementations for:
//! - Host directive parsing
//! - Splitting outbound payloads into BLE-sized chunks

pub mod chunker;
pub mod directive;

pub use chunker::{chunk_count, chunk_payload, MAX_CHUNK_SIZE};
pub use directive::{Directive, CONNECT_KEYWORD, DISCONNECT_KEYWORD};
