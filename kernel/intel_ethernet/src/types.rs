//! Type aliases for 32-bit registers that are used to initialize transmit queues.

/// Transmit Descriptor Base Address Low Register
pub type Tdbal  = u32;
/// Transmit Descriptor Base Address High Register
pub type Tdbah  = u32;
/// Transmit Descriptor Length Register
pub type Tdlen  = u32;
/// Transmit Descriptor Tail Register
pub type Tdt    = u32;
/// Transmit Descriptor Head Register
pub type Tdh    = u32;
