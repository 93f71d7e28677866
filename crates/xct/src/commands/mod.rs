//! Command implementations

pub mod launcher;
pub mod tool;
