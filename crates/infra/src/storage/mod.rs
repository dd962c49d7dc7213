//! Persistent storage backends for the state record

pub mod json_file;

pub use json_file::*;
