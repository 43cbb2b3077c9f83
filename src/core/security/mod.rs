#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Identity key management.

pub mod keystore;
