//! Per-channel tasks: one reader, one writer, one keepalive.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
