//! Application services

mod mailer;

pub use mailer::Mailer;
