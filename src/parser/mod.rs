//! Message decoding: header handling, transfer encodings, MIME structure and HTML helpers.

pub mod header;
pub mod html;
pub mod mime;
pub mod transfer;

pub use mime::{decode, decode_reader};
