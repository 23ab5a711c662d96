use crate::{
    api::{self, AppState},
    identity::{
        UniversalAuthService, gcp::GcpIdentityVerifier, jwks::JwksCache,
        secret_codec::SecretCodec, token::TokenSigner, trusted_ip::TrustedIpList,
    },
    store::{IdentityDirectory, MemoryStore, PgStore, Store},
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub trusted_proxies: Vec<String>,
    pub secret_pepper: SecretString,
    pub token_signing_seed: Option<SecretString>,
    pub token_issuer: String,
    pub operator_token: Option<SecretString>,
    pub operation_timeout: Duration,
    pub gcp_audience: Option<String>,
    pub gcp_jwks_url: String,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store, signing key or GCP key source cannot be set up, or the
/// server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let (store, directory): (Arc<dyn Store>, Arc<dyn IdentityDirectory>) = match &args.dsn {
        Some(dsn) => {
            let pg = Arc::new(PgStore::connect(dsn).await?);
            let store: Arc<dyn Store> = pg.clone();
            let directory: Arc<dyn IdentityDirectory> = pg;
            (store, directory)
        }
        None => {
            warn!("No --dsn given, state is kept in memory and lost on restart");
            let memory = Arc::new(MemoryStore::new());
            let store: Arc<dyn Store> = memory.clone();
            let directory: Arc<dyn IdentityDirectory> = memory;
            (store, directory)
        }
    };

    let codec = SecretCodec::new(args.secret_pepper.expose_secret().as_bytes().to_vec());

    let signer = match &args.token_signing_seed {
        Some(seed) => TokenSigner::from_hex_seed(seed.expose_secret(), &args.token_issuer)
            .context("Invalid --token-signing-seed")?,
        None => {
            warn!("No --token-signing-seed given, access tokens will not survive a restart");
            TokenSigner::generate(&args.token_issuer)
                .context("Failed to generate token signing key")?
        }
    };
    info!(key_id = signer.key_id(), "Access token signing key loaded");

    let mut service =
        UniversalAuthService::new(store.clone(), directory, codec, Arc::new(signer))
            .with_operation_timeout(args.operation_timeout);

    if let Some(audience) = &args.gcp_audience {
        let keys = JwksCache::new_remote(args.gcp_jwks_url.clone())?;
        service = service.with_gcp_verifier(GcpIdentityVerifier::new(
            store,
            Arc::new(keys),
            audience.clone(),
        ));
    } else {
        info!("GCP login disabled: no --gcp-audience given");
    }

    let mut state = AppState::new(service, args.operator_token.as_ref());
    if args.trusted_proxies.is_empty() {
        info!("No --trusted-proxies given, forwarding headers are ignored");
    } else {
        let proxies = TrustedIpList::parse(args.trusted_proxies.iter().cloned())
            .context("Invalid --trusted-proxies")?;
        state = state.with_trusted_proxies(proxies);
    }

    api::serve(args.port, Arc::new(state)).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "store",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        (
            "trusted_proxies",
            if args.trusted_proxies.is_empty() {
                "none".to_string()
            } else {
                args.trusted_proxies.join(",")
            },
        ),
        ("token_issuer", args.token_issuer.clone()),
        (
            "token_signing_seed_set",
            args.token_signing_seed.is_some().to_string(),
        ),
        ("operator_token_set", args.operator_token.is_some().to_string()),
        (
            "operation_timeout_ms",
            args.operation_timeout.as_millis().to_string(),
        ),
        (
            "gcp_audience",
            args.gcp_audience
                .clone()
                .unwrap_or_else(|| "disabled".to_string()),
        ),
        ("gcp_jwks_url", args.gcp_jwks_url.clone()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {}\n\n{title}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}
