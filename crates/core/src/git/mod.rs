//! Git subrepos driven through the command-line client.

pub mod client;

pub use client::GitSubrepo;
