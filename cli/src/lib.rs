//! Layerfold CLI - unpack and save OCI images.

pub mod commands;
pub mod output;
