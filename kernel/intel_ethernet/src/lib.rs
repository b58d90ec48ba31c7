//! Types shared by drivers for Intel ethernet devices:
//! the in-memory transmit descriptor formats and the register value types
//! used to set up a transmit queue.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate zerocopy;
extern crate memory;
extern crate kernel_config;

pub mod descriptors;
pub mod types;
