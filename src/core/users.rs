//! User trust-state transitions and the admin operations built on them.
//!
//! Status only moves down through lock and ban; the sole way up is
//! confirmation, which refuses locked accounts.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    audit, finish, password, tokens, validate, Context, Error, Kredo, Result,
};
use crate::models::{AuditAction, Role, Status, User, SUPER_ADMIN_ID};
use crate::store::{Transaction, UserFilter};

pub async fn get_user(tx: &mut dyn Transaction, id: Uuid) -> Result<User> {
    tx.first_user(UserFilter::Id(id))
        .await?
        .ok_or(Error::NotFound("user"))
}

/// `email` must already be normalized.
pub async fn get_user_with_email(tx: &mut dyn Transaction, email: &str) -> Result<User> {
    tx.first_user(UserFilter::Email(email))
        .await?
        .ok_or(Error::NotFound("user"))
}

/// Set `confirmed_at` and activate. Returns `false` when already confirmed.
pub async fn confirm_user(
    tx: &mut dyn Transaction,
    user: &mut User,
    at: DateTime<Utc>,
) -> Result<bool> {
    if user.is_confirmed() {
        return Ok(false);
    }
    if user.is_locked() {
        return Err(Error::policy("account is locked"));
    }
    user.confirmed_at = Some(at);
    if user.status < Status::Active {
        user.status = Status::Active;
    }
    tx.save_user(user).await?;
    Ok(true)
}

/// Apply the role lattice. Returns `false` for no-op requests.
pub async fn change_role(
    tx: &mut dyn Transaction,
    actor: &User,
    target: &mut User,
    role: Role,
) -> Result<bool> {
    match role {
        Role::Super => return Err(Error::policy("the super role cannot be granted")),
        Role::System => return Err(Error::validation("role", "system role cannot be assigned")),
        Role::User | Role::Admin => {}
    }
    if !actor.is_admin() && !actor.is_super() {
        return Err(Error::policy("admin role required"));
    }
    if target.role == Role::System {
        return Err(Error::policy("system users cannot change role"));
    }
    if target.role == role || (role == Role::Admin && target.role >= Role::Admin) {
        return Ok(false);
    }
    if target.is_super() {
        return Err(Error::policy("super admin role cannot be changed"));
    }
    let touches_admin = role == Role::Admin || target.role == Role::Admin;
    if touches_admin && !actor.is_super() {
        return Err(Error::policy("super admin required to grant or revoke admin"));
    }
    target.role = role;
    tx.save_user(target).await?;
    Ok(true)
}

/// Returns `false` if the user is already locked or banned.
pub async fn lock_user(tx: &mut dyn Transaction, user: &mut User) -> Result<bool> {
    if user.is_locked() {
        return Ok(false);
    }
    user.status = Status::Locked;
    tx.save_user(user).await?;
    Ok(true)
}

/// Returns `false` if the user is already banned.
pub async fn ban_user(tx: &mut dyn Transaction, user: &mut User) -> Result<bool> {
    if user.is_banned() {
        return Ok(false);
    }
    user.status = Status::Banned;
    tx.save_user(user).await?;
    Ok(true)
}

/// Banned users are never deleted so their email stays reserved.
pub async fn delete_user(
    tx: &mut dyn Transaction,
    user: &User,
    hard: bool,
    at: DateTime<Utc>,
) -> Result<bool> {
    if user.is_banned() {
        return Ok(false);
    }
    tx.delete_user(user.id, hard, at).await?;
    Ok(true)
}

/// The reserved super admin, which has no row.
fn super_admin() -> User {
    let mut user = User::new("", "", "super");
    user.id = SUPER_ADMIN_ID;
    user.role = Role::Super;
    user.status = Status::Verified;
    user.confirmed_at = Some(user.created_at);
    user.verified_at = Some(user.created_at);
    user
}

/// Resolve the acting admin: an authenticated, active user with role admin or higher.
pub async fn validate_admin(tx: &mut dyn Transaction, ctx: &Context) -> Result<User> {
    let Some(id) = ctx.admin_id().or_else(|| ctx.user_id()) else {
        return Err(Error::policy("admin role required"));
    };
    if id == SUPER_ADMIN_ID {
        return Ok(super_admin());
    }
    let actor = tx
        .first_user(UserFilter::Id(id))
        .await?
        .ok_or_else(|| Error::policy("admin role required"))?;
    if !actor.is_admin() || !actor.is_active() {
        return Err(Error::policy("admin role required"));
    }
    if !tokens::has_usable_refresh_token(tx, actor.id).await? {
        return Err(Error::policy("admin is not signed in"));
    }
    Ok(actor)
}

impl Kredo {
    pub async fn get_user(&self, id: Uuid) -> Result<User> {
        let mut tx = self.begin().await?;
        let result = get_user(tx.as_mut(), id).await;
        finish(tx, result).await
    }

    pub async fn get_user_with_email(&self, email: &str) -> Result<User> {
        let email = validate::email(email)?;
        let mut tx = self.begin().await?;
        let result = get_user_with_email(tx.as_mut(), &email).await;
        finish(tx, result).await
    }

    /// Banned and live users hold their email; soft-deleted users release it.
    pub async fn is_email_taken(&self, email: &str) -> Result<bool> {
        let email = validate::email(email)?;
        let mut tx = self.begin().await?;
        let result = tx
            .first_user(UserFilter::Email(&email))
            .await
            .map(|user| user.is_some())
            .map_err(Error::from);
        finish(tx, result).await
    }

    /// The user behind a session: active and holding a usable refresh token.
    pub async fn get_authenticated_user(&self, id: Uuid) -> Result<User> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let user = get_user(tx.as_mut(), id).await?;
            if !user.is_active() {
                return Err(Error::policy("inactive user"));
            }
            if !tokens::has_usable_refresh_token(tx.as_mut(), id).await? {
                return Err(Error::policy("user is not signed in"));
            }
            Ok(user)
        }
        .await;
        finish(tx, result).await
    }

    pub async fn update_user(
        &self,
        ctx: &Context,
        id: Uuid,
        username: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Result<User> {
        let username = username.map(validate::username).transpose()?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let mut user = get_user(tx.as_mut(), id).await?;
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            let mut changed = Vec::new();
            if let Some(username) = username {
                if username != user.username {
                    user.username = username;
                    changed.push("username");
                }
            }
            if let Some(data) = data {
                if data != user.data {
                    user.data = data;
                    changed.push("data");
                }
            }
            if changed.is_empty() {
                return Ok(user);
            }
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Updated,
                user.id,
                audit::fields(json!({ "changed": changed })),
            )
            .await?;
            Ok(user)
        }
        .await;
        finish(tx, result).await
    }

    #[instrument(skip(self, ctx, old, new))]
    pub async fn change_password(
        &self,
        ctx: &Context,
        id: Uuid,
        old: &str,
        new: &str,
    ) -> Result<User> {
        validate::password(new, self.config.min_password_length())?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let mut user = get_user(tx.as_mut(), id).await?;
            if !user.is_active() {
                return Err(Error::policy("inactive user"));
            }
            let current = user
                .password
                .as_deref()
                .ok_or_else(|| Error::policy("password login is not enabled"))?;
            if !password::verify(current, old).await? {
                return Err(Error::policy("invalid password"));
            }
            user.password = Some(password::hash(new).await?);
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Password,
                user.id,
                audit::Fields::new(),
            )
            .await?;
            Ok(user)
        }
        .await;
        finish(tx, result).await
    }

    /// Change a user's role. `role` is parsed; `super` is never accepted.
    #[instrument(skip(self, ctx))]
    pub async fn change_role(&self, ctx: &Context, id: Uuid, role: &str) -> Result<User> {
        let role = validate::role(role)?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let actor = validate_admin(tx.as_mut(), ctx).await?;
            let mut target = get_user(tx.as_mut(), id).await?;
            let from = target.role;
            if change_role(tx.as_mut(), &actor, &mut target, role).await? {
                audit::record(
                    tx.as_mut(),
                    ctx,
                    AuditAction::ChangeRole,
                    target.id,
                    audit::fields(json!({
                        "from": from.as_str(),
                        "to": role.as_str(),
                        "admin_id": actor.id.to_string(),
                    })),
                )
                .await?;
                info!(user_id = %target.id, %from, to = %role, "role changed");
            }
            Ok(target)
        }
        .await;
        finish(tx, result).await
    }

    pub async fn promote_user(&self, ctx: &Context, id: Uuid) -> Result<User> {
        self.change_role(ctx, id, Role::Admin.as_str()).await
    }

    #[instrument(skip(self, ctx))]
    pub async fn lock_user(&self, ctx: &Context, id: Uuid) -> Result<User> {
        self.restrict(ctx, id, AuditAction::Locked).await
    }

    #[instrument(skip(self, ctx))]
    pub async fn ban_user(&self, ctx: &Context, id: Uuid) -> Result<User> {
        self.restrict(ctx, id, AuditAction::Banned).await
    }

    async fn restrict(&self, ctx: &Context, id: Uuid, action: AuditAction) -> Result<User> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let actor = validate_admin(tx.as_mut(), ctx).await?;
            let mut target = get_user(tx.as_mut(), id).await?;
            if target.is_super() || (target.is_admin() && !actor.is_super()) {
                return Err(Error::policy("insufficient role to restrict this user"));
            }
            let changed = if action == AuditAction::Banned {
                ban_user(tx.as_mut(), &mut target).await?
            } else {
                lock_user(tx.as_mut(), &mut target).await?
            };
            if changed {
                audit::record(
                    tx.as_mut(),
                    ctx,
                    action,
                    target.id,
                    audit::fields(json!({ "admin_id": actor.id.to_string() })),
                )
                .await?;
            }
            Ok(target)
        }
        .await;
        finish(tx, result).await
    }

    /// Soft delete, or purge when `hard`. Banned users are left in place.
    #[instrument(skip(self, ctx))]
    pub async fn delete_user(&self, ctx: &Context, id: Uuid, hard: bool) -> Result<()> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let actor = validate_admin(tx.as_mut(), ctx).await?;
            let target = get_user(tx.as_mut(), id).await?;
            if target.is_super() || (target.is_admin() && !actor.is_super()) {
                return Err(Error::policy("insufficient role to delete this user"));
            }
            if delete_user(tx.as_mut(), &target, hard, Utc::now()).await? {
                tokens::revoke_all_refresh_tokens(tx.as_mut(), target.id).await?;
                audit::record(
                    tx.as_mut(),
                    ctx,
                    AuditAction::Deleted,
                    target.id,
                    audit::fields(json!({
                        "admin_id": actor.id.to_string(),
                        "hard": hard,
                    })),
                )
                .await?;
            }
            Ok(())
        }
        .await;
        finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::ErrorKind, test_support::*};
    use crate::store::{MemoryStore, Store};

    fn user_with(role: Role) -> User {
        let mut user = User::new("kredo", &format!("{}@example.com", Uuid::new_v4()), "u");
        user.role = role;
        user.status = Status::Active;
        user.confirmed_at = Some(Utc::now());
        user
    }

    async fn stored(store: &MemoryStore, user: &User) -> anyhow::Result<()> {
        let mut tx = store.begin().await?;
        tx.create_user(user).await?;
        tx.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn confirm_is_idempotent() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut user = User::new("kredo", "a@example.com", "a");
        stored(&store, &user).await?;
        let mut tx = store.begin().await?;

        assert!(confirm_user(tx.as_mut(), &mut user, Utc::now()).await?);
        assert!(user.is_active());
        let confirmed_at = user.confirmed_at;
        assert!(!confirm_user(tx.as_mut(), &mut user, Utc::now()).await?);
        assert_eq!(user.confirmed_at, confirmed_at);
        Ok(())
    }

    #[tokio::test]
    async fn confirm_never_unlocks() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut user = User::new("kredo", "a@example.com", "a");
        user.status = Status::Locked;
        stored(&store, &user).await?;
        let mut tx = store.begin().await?;

        let err = confirm_user(tx.as_mut(), &mut user, Utc::now()).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        assert_eq!(user.status, Status::Locked);
        Ok(())
    }

    #[tokio::test]
    async fn role_lattice() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let admin = user_with(Role::Admin);
        let superuser = super_admin();
        let mut target = user_with(Role::User);
        let mut other_admin = user_with(Role::Admin);
        stored(&store, &target).await?;
        stored(&store, &other_admin).await?;
        let mut tx = store.begin().await?;

        // re-granting admin to an admin is a no-op, even for a plain admin actor
        assert!(!change_role(tx.as_mut(), &admin, &mut other_admin, Role::Admin).await?);
        // super can never be granted
        let err = change_role(tx.as_mut(), &superuser, &mut target, Role::Super).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        // only super grants admin
        let err = change_role(tx.as_mut(), &admin, &mut target, Role::Admin).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        assert!(change_role(tx.as_mut(), &superuser, &mut target, Role::Admin).await?);
        assert_eq!(target.role, Role::Admin);
        // only super revokes admin
        let err = change_role(tx.as_mut(), &admin, &mut target, Role::User).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        assert!(change_role(tx.as_mut(), &superuser, &mut target, Role::User).await?);
        // users cannot change roles at all
        let plain = user_with(Role::User);
        let err = change_role(tx.as_mut(), &plain, &mut other_admin, Role::User).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        Ok(())
    }

    #[tokio::test]
    async fn system_users_keep_their_role() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut system = user_with(Role::System);
        stored(&store, &system).await?;
        let mut tx = store.begin().await?;

        for role in [Role::User, Role::Admin] {
            let err = change_role(tx.as_mut(), &super_admin(), &mut system, role).await;
            assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        }
        assert_eq!(system.role, Role::System);
        assert_eq!(get_user(tx.as_mut(), system.id).await?.role, Role::System);
        Ok(())
    }

    #[tokio::test]
    async fn lock_and_ban_only_move_down() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut user = user_with(Role::User);
        stored(&store, &user).await?;
        let mut tx = store.begin().await?;

        assert!(lock_user(tx.as_mut(), &mut user).await?);
        assert!(!lock_user(tx.as_mut(), &mut user).await?);
        assert!(ban_user(tx.as_mut(), &mut user).await?);
        assert!(!lock_user(tx.as_mut(), &mut user).await?);
        assert_eq!(user.status, Status::Banned);
        assert!(!ban_user(tx.as_mut(), &mut user).await?);
        Ok(())
    }

    #[tokio::test]
    async fn banned_users_are_never_deleted() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut user = user_with(Role::User);
        user.status = Status::Banned;
        stored(&store, &user).await?;
        let mut tx = store.begin().await?;

        assert!(!delete_user(tx.as_mut(), &user, false, Utc::now()).await?);
        assert!(!delete_user(tx.as_mut(), &user, true, Utc::now()).await?);
        assert!(get_user(tx.as_mut(), user.id).await?.is_banned());
        Ok(())
    }

    #[tokio::test]
    async fn admin_ops_require_a_signed_in_admin() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let admin = user_with(Role::Admin);
        let target = user_with(Role::User);
        stored(&store, &admin).await?;
        stored(&store, &target).await?;

        let ctx = Context::new().with_admin(admin.id);
        let err = kredo.lock_user(&ctx, target.id).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let mut tx = store.begin().await?;
        tokens::grant_refresh_token(tx.as_mut(), admin.id).await?;
        tx.commit().await?;

        let locked = kredo.lock_user(&ctx, target.id).await?;
        assert_eq!(locked.status, Status::Locked);
        let entries = store.audit_entries().await;
        assert_eq!(entries.last().map(|e| e.action), Some(AuditAction::Locked));
        Ok(())
    }

    #[tokio::test]
    async fn super_admin_changes_roles_by_name() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let target = user_with(Role::User);
        stored(&store, &target).await?;
        let ctx = Context::new().with_admin(SUPER_ADMIN_ID);

        let err = kredo.change_role(&ctx, target.id, "overlord").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));
        let err = kredo.change_role(&ctx, target.id, "super").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let promoted = kredo.promote_user(&ctx, target.id).await?;
        assert_eq!(promoted.role, Role::Admin);
        let again = kredo.promote_user(&ctx, target.id).await?;
        assert_eq!(again.role, Role::Admin);

        let changes = store
            .audit_entries()
            .await
            .into_iter()
            .filter(|e| e.action == AuditAction::ChangeRole)
            .count();
        assert_eq!(changes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn deleting_releases_the_email_unless_banned() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let normal = user_with(Role::User);
        let mut banned = user_with(Role::User);
        banned.status = Status::Banned;
        stored(&store, &normal).await?;
        stored(&store, &banned).await?;
        let ctx = Context::new().with_admin(SUPER_ADMIN_ID);

        kredo.delete_user(&ctx, normal.id, false).await?;
        assert_eq!(
            kredo.get_user(normal.id).await.err().map(|e| e.kind()),
            Some(ErrorKind::NotFound)
        );
        assert!(!kredo.is_email_taken(&normal.email).await?);

        kredo.delete_user(&ctx, banned.id, true).await?;
        assert!(kredo.get_user(banned.id).await?.is_banned());
        assert!(kredo.is_email_taken(&banned.email).await?);
        Ok(())
    }
}
