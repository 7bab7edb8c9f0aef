mod auth;
mod client;

pub use auth::{AuthClient, AuthError, AuthSession};
pub use client::{ApiErrorClass, InboxClient, InboxError, InboxRecord, NewDocument};
