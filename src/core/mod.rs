#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Core primitives: crypto, the package container, configuration and the
//! host identity.

pub mod config;
pub mod crypto;
pub mod hostkey;
pub mod package;
