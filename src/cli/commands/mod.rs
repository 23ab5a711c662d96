pub mod auth;
pub mod gcp;
pub mod logging;

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_TRUSTED_PROXIES: &str = "trusted-proxies";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("universal-auth")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("UNIVERSAL_AUTH_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .long_help(
                    "PostgreSQL connection string. Without it state is kept in memory and lost on restart.",
                )
                .env("UNIVERSAL_AUTH_DSN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXIES)
                .long(ARG_TRUSTED_PROXIES)
                .help("Proxy CIDRs allowed to set X-Forwarded-For / X-Real-IP")
                .long_help(
                    "Comma separated CIDRs of reverse proxies. Forwarding headers are ignored unless the socket peer is in this list; trusted IP checks otherwise use the peer address.",
                )
                .env("UNIVERSAL_AUTH_TRUSTED_PROXIES")
                .value_delimiter(',')
                .action(ArgAction::Append),
        );

    let command = auth::with_args(command);
    let command = gcp::with_args(command);
    logging::with_args(command)
}
