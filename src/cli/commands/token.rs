use anyhow::{Context, Result};
use clap::{Arg, Command};
use secrecy::SecretString;

pub const ARG_TOKEN_SECRET: &str = "token-secret";
pub const ARG_ACCESS_TTL: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL: &str = "refresh-ttl-seconds";
pub const ARG_ISSUER: &str = "issuer";
pub const ARG_OTP_SECRET: &str = "otp-secret";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SECRET)
                .long(ARG_TOKEN_SECRET)
                .help("HMAC-SHA256 signing secret for access and refresh tokens")
                .env("PERANTO_TOKEN_SECRET")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in seconds")
                .default_value("900")
                .env("PERANTO_ACCESS_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token lifetime in seconds")
                .default_value("604800")
                .env("PERANTO_REFRESH_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer label shown in authenticator apps")
                .default_value("Peranto")
                .env("PERANTO_ISSUER"),
        )
        .arg(
            Arg::new(ARG_OTP_SECRET)
                .long(ARG_OTP_SECRET)
                .help("Server-side pepper for one-time code digests")
                .env("PERANTO_OTP_SECRET")
                .required(true),
        )
}

#[derive(Debug)]
pub struct Options {
    pub token_secret: SecretString,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub issuer: String,
    pub otp_secret: SecretString,
}

impl Options {
    /// # Errors
    /// Returns an error when a required argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let token_secret = matches
            .get_one::<String>(ARG_TOKEN_SECRET)
            .cloned()
            .context("missing required argument: --token-secret")?;
        let otp_secret = matches
            .get_one::<String>(ARG_OTP_SECRET)
            .cloned()
            .context("missing required argument: --otp-secret")?;
        Ok(Self {
            token_secret: SecretString::from(token_secret),
            access_ttl_seconds: matches
                .get_one::<i64>(ARG_ACCESS_TTL)
                .copied()
                .unwrap_or(900),
            refresh_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TTL)
                .copied()
                .unwrap_or(604_800),
            issuer: matches
                .get_one::<String>(ARG_ISSUER)
                .cloned()
                .unwrap_or_else(|| "Peranto".to_string()),
            otp_secret: SecretString::from(otp_secret),
        })
    }
}
