//! Web server module for the claim intake.
//!
//! The handlers only translate HTTP to a [`Receiver`](crate::Receiver) call
//! and its outcome back to a status code. Validation and enqueueing live in
//! the receiver.

pub mod handlers;

pub use handlers::{health, router, submit_claim, AppState, ClaimResponse, HealthResponse};
