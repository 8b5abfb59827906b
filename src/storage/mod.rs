//! Versioned tree storage on top of the log.

pub mod btree;
