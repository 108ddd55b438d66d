pub mod logging;
pub mod token;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("peranto")
        .about("Identity broker")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8088")
                .env("PERANTO_PORT")
                .value_parser(clap::value_parser!(u16)),
        );

    let command = token::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "peranto");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Identity broker".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_port_and_secrets() {
        let command = new();
        let matches = command.get_matches_from(vec![
            "peranto",
            "--port",
            "9090",
            "--token-secret",
            "signing-secret",
            "--otp-secret",
            "otp-pepper",
        ]);

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(9090));
        assert_eq!(
            matches
                .get_one::<String>(token::ARG_TOKEN_SECRET)
                .map(String::as_str),
            Some("signing-secret")
        );
    }
}
