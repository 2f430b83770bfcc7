//! Single-session connection and playback-state manager for Sendspin players.
//!
//! A [`session::Session`] owns at most one connection to a Sendspin server,
//! reconnects with backoff when it drops, and keeps a
//! [`state::PlaybackState`] snapshot in sync with the server. Subscribers get
//! that snapshot on every change, commands go out through the
//! [`session::Handle`], and a [`lease::Coordinator`] makes sure only one
//! process runs a session per client identity.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod audio;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod lease;
pub mod policy;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod source;
pub mod state;
pub mod storage;
pub mod subscribers;
pub mod transport;
