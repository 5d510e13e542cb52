//! Weave sync server: token issuance plus per-user BSO storage.
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate slog_scope;

pub mod error;
pub mod logging;
pub mod server;
pub mod tokenserver;
pub mod web;
