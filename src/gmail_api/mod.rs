//! Gmail API module split into logical submodules
//!
//! - auth: credential lifecycle (token files, refresh, interactive consent)
//! - client: typed REST client and the `MailApi` trait behind it
//! - labels: label name resolution
//! - messages: lazy paginated message enumeration

pub mod auth;
pub mod client;
pub mod labels;
pub mod messages;

// Re-export the pieces the binary and the pipeline use most.
pub use auth::{read_client_secrets, Authenticator, ClientConfig, Credential, CredentialManager};
pub use client::{GmailClient, MailApi};
pub use labels::resolve_label_id;
pub use messages::list_messages;
