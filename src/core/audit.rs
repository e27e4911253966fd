//! Audit entries are written inside the caller's transaction; a failed write
//! aborts the whole operation.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::{context::Context, error::Result};
use crate::models::{AuditAction, AuditEntry, Token};
use crate::store::Transaction;

pub type Fields = Map<String, Value>;

/// Turn a `json!` object into audit fields; anything else yields no fields.
#[must_use]
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn timestamp(at: Option<DateTime<Utc>>) -> Value {
    at.map_or(Value::Null, |at| json!(at.to_rfc3339()))
}

/// Describe a token without its secret.
pub fn token_fields<T: Token + ?Sized>(token: &T) -> Fields {
    fields(json!({
        "token_id": token.access().id.to_string(),
        "class": token.class().as_str(),
        "usage": token.usage().as_str(),
        "issued": timestamp(token.issued()),
        "last_used": timestamp(token.last_used()),
        "expiration": timestamp(token.expiration_date()),
        "revoked": timestamp(token.revoked()),
    }))
}

pub async fn record(
    tx: &mut dyn Transaction,
    ctx: &Context,
    action: AuditAction,
    user_id: Uuid,
    mut fields: Fields,
) -> Result<()> {
    if let Some(ip) = ctx.ip() {
        fields
            .entry("ip_address")
            .or_insert_with(|| json!(ip.to_string()));
    }
    if let Some(provider) = ctx.provider() {
        fields
            .entry("provider")
            .or_insert_with(|| json!(provider));
    }
    if let Some(actor) = ctx.user_id() {
        fields
            .entry("user_id")
            .or_insert_with(|| json!(actor.to_string()));
    }
    if let Some(admin) = ctx.admin_id() {
        fields
            .entry("admin_id")
            .or_insert_with(|| json!(admin.to_string()));
    }

    let entry = AuditEntry::new(action, user_id, fields);
    tx.create_audit_entry(&entry).await?;

    debug!(action = %action, kind = entry.kind.as_str(), %user_id, "audit entry recorded");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RefreshToken;
    use crate::store::{MemoryStore, Store};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn token_fields_never_include_the_secret() -> anyhow::Result<()> {
        let rt = RefreshToken::new(Uuid::new_v4())?;
        let fields = token_fields(&rt);
        assert_eq!(fields.get("class"), Some(&json!("refresh")));
        assert!(!Value::Object(fields).to_string().contains(&rt.access.token));
        Ok(())
    }

    #[tokio::test]
    async fn context_is_folded_into_fields() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ctx = Context::new()
            .with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_provider("kredo");
        let user = Uuid::new_v4();

        let mut tx = store.begin().await?;
        record(
            tx.as_mut(),
            &ctx,
            AuditAction::Login,
            user,
            fields(json!({ "provider": "github" })),
        )
        .await?;
        tx.commit().await?;

        let entries = store.audit_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, user);
        assert_eq!(entries[0].fields.get("ip_address"), Some(&json!("127.0.0.1")));
        // explicit fields win over the context
        assert_eq!(entries[0].fields.get("provider"), Some(&json!("github")));
        Ok(())
    }
}
