//! The SMTP side: dialogue, listener and runtime rebinding.

pub mod rebind;
pub mod server;
pub mod session;

pub use server::SmtpListener;
pub use session::{Reply, Session, SessionState};
