#![deny(clippy::all, clippy::pedantic, clippy::nursery, dead_code)]

//! Identity verification gate for group chats
//!
//! New members of a configured group get a pending verification session. The session is
//! resolved by a zero-knowledge proof submitted through the wallet deep link, by a timeout
//! or by an administrator. Committed session changes are turned into moderation actions by
//! the [`dispatcher`].

pub mod admin;
pub mod bot;
pub mod chat;
pub mod dispatcher;
pub mod lifecycle;
pub mod supervisor;
pub mod types;
pub mod zkp;

pub use bot::VerificationBot;
