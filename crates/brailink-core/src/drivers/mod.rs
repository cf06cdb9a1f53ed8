//! Vendor drivers.
//!
//! Each driver is a model table plus a frame verifier and decoder over the
//! shared packet reader, key queue and differential writer.

pub mod eurobraille;
pub mod iris;
pub mod ninepoint;
pub mod tsi;
