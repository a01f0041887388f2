pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod hash;
pub mod index;
pub mod prepare;
pub mod promote;
pub mod report;
pub mod resource;
pub mod rollout;
pub mod scheduler;

pub use error::{Error, Result};
