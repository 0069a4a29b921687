//! Utility modules shared by the codec and storage layers.

pub mod varint;
