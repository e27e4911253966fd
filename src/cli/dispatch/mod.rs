use crate::cli::actions::{server::Args, Action};
use crate::core::{CoreConfig, JwtConfig, SignupConfig};
use anyhow::{Context, Result};
use chrono::Duration;
use jsonwebtoken::Algorithm;
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let vault_url = matches.get_one::<String>("vault-url").cloned();
    let jwt_secret = matches
        .get_one::<String>("jwt-secret")
        .map(|s| SecretString::from(s.as_str()));
    if vault_url.is_none() && jwt_secret.is_none() {
        anyhow::bail!("missing required argument: --jwt-secret (or --vault-url to read it from Vault)");
    }
    if vault_url.is_some()
        && !matches.contains_id("vault-secret-id")
        && !matches.contains_id("vault-wrapped-token")
    {
        anyhow::bail!("missing required argument: --vault-secret-id or --vault-wrapped-token");
    }

    Ok(Action::Server(Args {
        port,
        dsn,
        migrate: matches.get_flag("migrate"),
        vault_url,
        vault_role_id: matches.get_one::<String>("vault-role-id").cloned(),
        vault_secret_id: matches.get_one::<String>("vault-secret-id").cloned(),
        vault_wrapped_token: matches.get_one::<String>("vault-wrapped-token").cloned(),
        vault_db_role: matches
            .get_one::<String>("vault-db-role")
            .cloned()
            .unwrap_or_else(|| "kredo".to_string()),
        vault_jwt_path: matches
            .get_one::<String>("vault-jwt-path")
            .cloned()
            .unwrap_or_default(),
        jwt_secret,
        core: core_settings(matches)?,
    }))
}

/// Everything in [`CoreConfig`] except the JWT secret, which may come from Vault.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub algorithm: Algorithm,
    pub issuer: String,
    pub audience: Vec<String>,
    pub jwt_expiration: Duration,
    pub confirm_expiration: Duration,
    pub send_limit: Duration,
    pub mail_disabled: bool,
    pub debug_pin: bool,
    pub signup: SignupConfig,
}

impl CoreSettings {
    #[must_use]
    pub fn into_config(self, secret: SecretString) -> CoreConfig {
        let jwt = JwtConfig::new(secret)
            .with_algorithm(self.algorithm)
            .with_issuer(self.issuer)
            .with_audience(self.audience)
            .with_expiration(self.jwt_expiration);
        CoreConfig::new(jwt)
            .with_signup(self.signup)
            .with_confirm_expiration(self.confirm_expiration)
            .with_send_limit(self.send_limit)
            .with_mail_disabled(self.mail_disabled)
            .with_debug_pin(self.debug_pin)
    }
}

fn seconds(matches: &clap::ArgMatches, name: &str, default: i64) -> Duration {
    Duration::seconds(matches.get_one::<i64>(name).copied().unwrap_or(default))
}

fn core_settings(matches: &clap::ArgMatches) -> Result<CoreSettings> {
    let algorithm = match matches.get_one::<String>("jwt-algorithm").map(String::as_str) {
        None | Some("HS256") => Algorithm::HS256,
        Some("HS384") => Algorithm::HS384,
        Some("HS512") => Algorithm::HS512,
        Some(other) => anyhow::bail!("unsupported JWT algorithm: {other}"),
    };

    Ok(CoreSettings {
        algorithm,
        issuer: matches
            .get_one::<String>("jwt-issuer")
            .cloned()
            .unwrap_or_else(|| "kredo".to_string()),
        audience: matches
            .get_many::<String>("jwt-audience")
            .map(|values| values.filter(|v| !v.is_empty()).cloned().collect())
            .unwrap_or_default(),
        jwt_expiration: seconds(matches, "jwt-expiration", 3600),
        confirm_expiration: seconds(matches, "confirm-expiration", 3600),
        send_limit: seconds(matches, "send-limit", 60),
        mail_disabled: matches.get_flag("mail-disabled"),
        debug_pin: matches.get_flag("debug-pin"),
        signup: SignupConfig {
            disabled: matches.get_flag("signup-disabled"),
            auto_confirm: matches.get_flag("signup-auto-confirm"),
            code_required: matches.get_flag("signup-code-required"),
            ..SignupConfig::default()
        },
    })
}
