//! IMAP to ntfy bridge — polls mailbox folders for unread mail and pushes
//! one notification per previously-unseen message.

pub mod bridge;
pub mod config;
pub mod error;
pub mod headers;
pub mod ledger;
pub mod mailbox;
pub mod notify;
