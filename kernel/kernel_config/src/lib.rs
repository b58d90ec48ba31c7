//! Compile-time configuration constants.
//!
//! Runtime knobs (e.g., the payload length of the test frame) default to the
//! values defined here, but can be overridden through `e1000::E1000Config`.

#![no_std]

pub mod memory;
pub mod nic;
