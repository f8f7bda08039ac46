//! Minimal SMTP client transaction layer for outbound delivery.
//!
//! This deliberately implements only what a delivery loop needs: connecting
//! with a bound source address, reading (possibly multi-line) responses with
//! timeouts, and the four transaction steps HELO-or-RSET, MAIL FROM, RCPT TO
//! and DATA. Each step reports a non-success peer reply to a caller-supplied
//! callback which decides whether the transaction aborts.

pub mod client;
pub mod client_types;

pub use client::*;
pub use client_types::*;
