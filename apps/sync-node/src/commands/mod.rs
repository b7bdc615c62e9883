//! # Console Commands
//!
//! Each line read from stdin is parsed into a [`sync::Command`] and run by
//! [`sync::execute`]; the reply is printed as one line of JSON.

pub mod sync;
