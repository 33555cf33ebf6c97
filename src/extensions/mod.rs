//! Optional extensions to the frame codec.
//!
//! | Module        | Description                                        |
//! |---------------|----------------------------------------------------|
//! | `compression` | zstd payload compression for `compressed` frames   |

#[cfg(feature = "compression")]
mod compression;

#[cfg(feature = "compression")]
pub use compression::*;
