pub mod config;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod source;
pub mod submit;
pub mod transform;
pub mod worker;
