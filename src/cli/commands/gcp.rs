use clap::{Arg, Command};

pub const ARG_GCP_AUDIENCE: &str = "gcp-audience";
pub const ARG_GCP_JWKS_URL: &str = "gcp-jwks-url";

pub const DEFAULT_GCP_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GCP_AUDIENCE)
                .long(ARG_GCP_AUDIENCE)
                .help("Expected audience of GCP identity tokens (GCP login is disabled if unset)")
                .env("UNIVERSAL_AUTH_GCP_AUDIENCE"),
        )
        .arg(
            Arg::new(ARG_GCP_JWKS_URL)
                .long(ARG_GCP_JWKS_URL)
                .help("Google signing keys URL")
                .env("UNIVERSAL_AUTH_GCP_JWKS_URL")
                .default_value(DEFAULT_GCP_JWKS_URL),
        )
}
