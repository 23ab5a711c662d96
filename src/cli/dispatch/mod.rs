use crate::cli::{
    actions::{Action, server::Args},
    commands::{ARG_TRUSTED_PROXIES, auth, gcp},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches.get_one::<String>("dsn").cloned();
    let trusted_proxies = matches
        .get_many::<String>(ARG_TRUSTED_PROXIES)
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let secret_pepper = matches
        .get_one::<String>(auth::ARG_SECRET_PEPPER)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --secret-pepper")?;
    let token_signing_seed = matches
        .get_one::<String>(auth::ARG_TOKEN_SIGNING_SEED)
        .cloned()
        .map(SecretString::from);
    let token_issuer = matches
        .get_one::<String>(auth::ARG_TOKEN_ISSUER)
        .cloned()
        .unwrap_or_else(|| "universal-auth".to_string());
    let operator_token = matches
        .get_one::<String>(auth::ARG_OPERATOR_TOKEN)
        .cloned()
        .map(SecretString::from);
    let operation_timeout = Duration::from_millis(
        matches
            .get_one::<u64>(auth::ARG_OPERATION_TIMEOUT_MS)
            .copied()
            .unwrap_or(10_000),
    );

    let gcp_audience = matches.get_one::<String>(gcp::ARG_GCP_AUDIENCE).cloned();
    let gcp_jwks_url = matches
        .get_one::<String>(gcp::ARG_GCP_JWKS_URL)
        .cloned()
        .unwrap_or_else(|| gcp::DEFAULT_GCP_JWKS_URL.to_string());

    Ok(Action::Server(Args {
        port,
        dsn,
        trusted_proxies,
        secret_pepper,
        token_signing_seed,
        token_issuer,
        operator_token,
        operation_timeout,
        gcp_audience,
        gcp_jwks_url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn builds_server_action() -> Result<()> {
        let matches = commands::new().try_get_matches_from(vec![
            "universal-auth",
            "--port",
            "9090",
            "--secret-pepper",
            "pepper",
            "--operator-token",
            "op-token",
            "--gcp-audience",
            "https://auth.example.test",
            "--operation-timeout-ms",
            "1500",
            "--trusted-proxies",
            "10.0.0.0/8",
        ])?;

        let Action::Server(args) = handler(&matches)?;
        assert_eq!(args.port, 9090);
        assert_eq!(args.secret_pepper.expose_secret(), "pepper");
        assert_eq!(
            args.operator_token.as_ref().map(|token| token.expose_secret()),
            Some("op-token")
        );
        assert_eq!(args.gcp_audience.as_deref(), Some("https://auth.example.test"));
        assert_eq!(args.operation_timeout, Duration::from_millis(1500));
        assert_eq!(args.trusted_proxies, vec!["10.0.0.0/8".to_string()]);
        Ok(())
    }
}
