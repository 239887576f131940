//! Copy labeled Gmail messages from one account to another.
//!
//! The crate splits into the credential lifecycle and typed API client
//! (`gmail_api`), the wire records (`types`), the migration pipeline
//! (`migrate`) and the small CLI surface (`cli`).

pub mod cli;
pub mod error;
pub mod gmail_api;
pub mod migrate;
pub mod types;
