//! Repeatguard.
//!
//! Operator tooling for the idempotency state kept by guarded services. It talks to the same
//! backend as the services, using the same token prefix, so it can be used to look at, claim and
//! release the entries of individual uniqueness keys.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
