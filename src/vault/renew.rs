use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, instrument, warn};

const RENEW_ATTEMPTS: u32 = 3;

/// Renew a Vault token
#[instrument(skip(token))]
async fn renew_token(vault_url: &str, token: &SecretString, increment: Option<u64>) -> Result<u64> {
    let renew_url = vault::endpoint_url(vault_url, "/v1/auth/token/renew-self")?;

    let payload = json!({
        "increment": increment.unwrap_or(0)
    });

    let response = vault::client()?
        .post(&renew_url)
        .json(&payload)
        .header("X-Vault-Token", token.expose_secret())
        .send()
        .await?;

    let json_response = vault::check(&renew_url, response).await?;

    json_response["auth"]["lease_duration"]
        .as_u64()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))
}

/// Between 70% and 90% of the lease, so renewals land before expiry.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn jittered(rng: &mut StdRng, lease_duration: u64) -> Duration {
    let factor = rng.gen_range(0.7..0.9);
    Duration::from_secs((lease_duration as f64 * factor) as u64)
}

/// Keep the Vault token alive in the background. `shutdown` is signalled when
/// renewal fails [`RENEW_ATTEMPTS`] times in a row.
#[instrument(skip(globals, shutdown))]
pub fn try_renew(globals: &GlobalArgs, lease_duration: u64, shutdown: mpsc::UnboundedSender<()>) {
    let vault_url = globals.vault_url.clone();
    let token = globals.vault_token.clone();

    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut wait = jittered(&mut rng, lease_duration);

        loop {
            info!("Will renew token in {} seconds", wait.as_secs());
            sleep(wait).await;

            let mut renewed = false;
            for attempt in 1..=RENEW_ATTEMPTS {
                if attempt > 1 {
                    let backoff_time = 2u64.pow(attempt - 1);
                    warn!("Backing off for {} seconds", backoff_time);
                    sleep(Duration::from_secs(backoff_time)).await;
                }

                match renew_token(&vault_url, &token, None).await {
                    Ok(lease_duration) => {
                        debug!("token lease duration {} seconds", lease_duration);
                        wait = jittered(&mut rng, lease_duration);
                        renewed = true;
                        break;
                    }
                    Err(e) => error!("Error renewing token: {}", e),
                }
            }

            if !renewed {
                error!("Failed to renew token after {RENEW_ATTEMPTS} attempts");
                let _ = shutdown.send(());
                return;
            }
        }
    });
}
