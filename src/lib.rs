//! Hi-Fi Bridge
//!
//! A source-agnostic control bridge that aggregates heterogeneous music
//! backends (Roon, Lyrion/LMS, OpenHome, UPnP/DLNA) plus HQPlayer DSP behind
//! one zone namespace. Hardware knobs, web UIs, Home Assistant and LLM agents
//! all drive the same bus.

// Deny truly dangerous patterns.
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod adapters;
pub mod api;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod hqp;
pub mod knobs;
pub mod settings;
