pub mod logger;
pub mod retry;
pub mod startup;
