//! Derive macros for the duelchain crate.
//!
//! Provides `#[derive(Error)]`, which generates `Display` and
//! `std::error::Error` implementations from `#[error("...")]` attributes
//! so error enums stay declarative without pulling in `thiserror`.

mod error;

use proc_macro::TokenStream;

/// Automatically implements `Display` and `Error` traits for error types.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
