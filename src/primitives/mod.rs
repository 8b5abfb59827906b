//! Low-level building blocks: byte codecs, file I/O and the record log.

pub mod bytes;
pub mod io;
pub mod log;
