mod client;
mod error;

pub use client::TaskClient;
pub use error::{ApiError, Result};
