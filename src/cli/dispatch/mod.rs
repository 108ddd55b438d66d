//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to the server action with its full
//! configuration.

use crate::cli::actions::{server, Action};
use crate::cli::commands::token;
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8088);
    let token_opts = token::Options::parse(matches)?;

    Ok(Action::Server(server::Args {
        port,
        token_secret: token_opts.token_secret,
        access_ttl_seconds: token_opts.access_ttl_seconds,
        refresh_ttl_seconds: token_opts.refresh_ttl_seconds,
        issuer: token_opts.issuer,
        otp_secret: token_opts.otp_secret,
    }))
}
