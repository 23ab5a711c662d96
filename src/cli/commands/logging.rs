//! Log verbosity and output format flags.

use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";

/// Accepts `0..=5` or a level name; the result is the `-v` count it stands for.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>()
            && parsed <= 5
        {
            return Ok(parsed);
        }

        let names = ["error", "warn", "info", "debug", "trace"];
        names
            .iter()
            .position(|name| level.eq_ignore_ascii_case(name))
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| format!("invalid log level {level:?}, expected one of {names:?}"))
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("UNIVERSAL_AUTH_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long(ARG_LOG_FORMAT)
                .help("Log output format")
                .env("UNIVERSAL_AUTH_LOG_FORMAT")
                .global(true)
                .default_value("pretty")
                .value_parser(["pretty", "json"]),
        )
}

/// Logging settings resolved from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogSettings {
    /// `None` keeps the ERROR default.
    pub level: Option<Level>,
    pub json: bool,
}

impl LogSettings {
    #[must_use]
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let verbosity = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
        Self {
            level: level_for(verbosity),
            json: matches
                .get_one::<String>(ARG_LOG_FORMAT)
                .is_some_and(|format| format == "json"),
        }
    }
}

const fn level_for(verbosity: u8) -> Option<Level> {
    match verbosity {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("universal-auth"))
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), None);
        assert_eq!(level_for(1), Some(Level::WARN));
        assert_eq!(level_for(2), Some(Level::INFO));
        assert_eq!(level_for(3), Some(Level::DEBUG));
        assert_eq!(level_for(9), Some(Level::TRACE));
    }

    #[test]
    fn settings_default_to_pretty_errors() {
        temp_env::with_vars(
            [
                ("UNIVERSAL_AUTH_LOG_LEVEL", None::<&str>),
                ("UNIVERSAL_AUTH_LOG_FORMAT", None),
            ],
            || {
                let settings = LogSettings::from_matches(&command().get_matches_from(["universal-auth"]));
                assert_eq!(
                    settings,
                    LogSettings {
                        level: None,
                        json: false
                    }
                );
            },
        );
    }

    #[test]
    fn settings_read_env() {
        temp_env::with_vars(
            [
                ("UNIVERSAL_AUTH_LOG_LEVEL", Some("INFO")),
                ("UNIVERSAL_AUTH_LOG_FORMAT", Some("json")),
            ],
            || {
                let settings = LogSettings::from_matches(&command().get_matches_from(["universal-auth"]));
                assert_eq!(settings.level, Some(Level::INFO));
                assert!(settings.json);
            },
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        temp_env::with_var("UNIVERSAL_AUTH_LOG_FORMAT", None::<&str>, || {
            assert!(
                command()
                    .try_get_matches_from(["universal-auth", "--log-format", "xml"])
                    .is_err()
            );
        });
    }
}
