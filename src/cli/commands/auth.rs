use clap::{Arg, Command};

pub const ARG_SECRET_PEPPER: &str = "secret-pepper";
pub const ARG_TOKEN_SIGNING_SEED: &str = "token-signing-seed";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_OPERATOR_TOKEN: &str = "operator-token";
pub const ARG_OPERATION_TIMEOUT_MS: &str = "operation-timeout-ms";

pub fn with_args(command: Command) -> Command {
    let command = with_secret_args(command);
    with_token_args(command)
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SECRET_PEPPER)
                .long(ARG_SECRET_PEPPER)
                .help("Server-side secret mixed into client secret hashes")
                .env("UNIVERSAL_AUTH_SECRET_PEPPER")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_OPERATOR_TOKEN)
                .long(ARG_OPERATOR_TOKEN)
                .help("Bearer token granting platform operator access to management routes")
                .env("UNIVERSAL_AUTH_OPERATOR_TOKEN")
                .hide_env_values(true),
        )
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SIGNING_SEED)
                .long(ARG_TOKEN_SIGNING_SEED)
                .help("Hex encoded 32 byte Ed25519 seed for access tokens (random per process if unset)")
                .env("UNIVERSAL_AUTH_TOKEN_SIGNING_SEED")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim of minted access tokens")
                .env("UNIVERSAL_AUTH_TOKEN_ISSUER")
                .default_value("universal-auth"),
        )
        .arg(
            Arg::new(ARG_OPERATION_TIMEOUT_MS)
                .long(ARG_OPERATION_TIMEOUT_MS)
                .help("Upper bound in milliseconds for a login or token use")
                .env("UNIVERSAL_AUTH_OPERATION_TIMEOUT_MS")
                .default_value("10000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
