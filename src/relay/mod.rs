pub mod config;
pub mod content;
pub mod dispatcher;
pub mod message;
pub mod verification;
