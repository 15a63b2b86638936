//! Row structs mirroring database tables.

pub mod job;
