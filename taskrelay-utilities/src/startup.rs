use log::info;

use crate::logger::{self, print_env};
use taskrelay_models::errors::SendableError;

pub fn startup(name: &str) -> Result<(), SendableError> {
    logger::setup_logger()?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
