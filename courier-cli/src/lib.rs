//! Library target for the `courier` package.
//!
//! The primary deliverable of this package is the `courier` CLI binary
//! (`src/main.rs`). This library exists so CI can run `cargo test -p courier --doc`.

#[doc(hidden)]
pub use courier_client;
