//! `papercut` is a local SMTP sink that captures every message it receives.
//!
//! The library holds the pieces: a directory-backed [`store`] of captured
//! files, the [`smtp`] listener that fills it, the MIME [`parser`], and the
//! cancellable [`pipeline`] that decodes whichever message the user is
//! looking at. [`service::MailService`] wires them together.

pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod render;
pub mod service;
pub mod smtp;
pub mod store;
