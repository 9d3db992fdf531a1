//! Bearer-token verification.
//!
//! Enterprise tenants authenticate against their IdP's introspection
//! endpoint; consumer accounts carry an opaque HMAC-signed session token
//! issued by this process after a password or OIDC-consumer login.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use cortex_core::types::{Principal, TenantMode};

use crate::error::{IdentityError, Result};
use crate::store::UserStore;

type HmacSha256 = Hmac<Sha256>;

/// Consumer session tokens expire after a week.
const SESSION_MAX_AGE_SECS: i64 = 7 * 24 * 3600;

/// Identity extracted from a validated bearer token, before the user row
/// is resolved.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    sub: Option<String>,
    email: Option<String>,
    name: Option<String>,
}

/// Turns bearer tokens into [`Principal`]s.
pub struct Authenticator {
    store: std::sync::Arc<UserStore>,
    http: reqwest::Client,
    enterprise_base: String,
    session_secret: Vec<u8>,
    auto_provision: bool,
}

impl Authenticator {
    pub fn new(
        store: std::sync::Arc<UserStore>,
        enterprise_base: impl Into<String>,
        session_secret: impl AsRef<[u8]>,
        auto_provision: bool,
    ) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            enterprise_base: enterprise_base.into(),
            session_secret: session_secret.as_ref().to_vec(),
            auto_provision,
        }
    }

    /// Resolve a bearer token to a Principal for the given tenant.
    ///
    /// Enterprise: introspect against the IdP, then find-or-provision the
    /// user. Consumer: verify the opaque session token locally. Inactive
    /// users fail closed even with a valid token.
    pub async fn authenticate(
        &self,
        bearer: &str,
        tenant_id: Uuid,
        mode: TenantMode,
    ) -> Result<Principal> {
        let user = match mode {
            TenantMode::Enterprise => {
                let verified = self.introspect(bearer).await?;
                self.resolve_enterprise_user(tenant_id, &verified)?
            }
            TenantMode::Consumer => {
                let user_id = self.verify_session(bearer)?;
                self.store
                    .by_id(user_id)?
                    .ok_or_else(|| IdentityError::AuthFailed("unknown session user".into()))?
            }
        };

        if user.tenant_id != tenant_id {
            return Err(IdentityError::AuthFailed("tenant mismatch".into()));
        }
        if !user.is_active {
            return Err(IdentityError::Inactive);
        }
        self.store.touch_login(user.id)?;
        Ok(user.principal())
    }

    /// Verify an enterprise bearer token with the IdP. The raw token is
    /// never logged.
    async fn introspect(&self, bearer: &str) -> Result<VerifiedToken> {
        let url = format!("{}/oauth2/introspect", self.enterprise_base);
        let resp = self
            .http
            .post(&url)
            .form(&[("token", bearer)])
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "idp introspection rejected");
            return Err(IdentityError::AuthFailed("introspection rejected".into()));
        }
        let body: IntrospectionResponse = resp
            .json()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;

        if !body.active {
            return Err(IdentityError::AuthFailed("token inactive".into()));
        }
        let subject = body
            .sub
            .ok_or_else(|| IdentityError::AuthFailed("no subject in token".into()))?;
        let email = body
            .email
            .ok_or_else(|| IdentityError::AuthFailed("no email in token".into()))?;
        Ok(VerifiedToken {
            subject,
            email,
            display_name: body.name,
        })
    }

    /// Lookup order: subject id, then email (binding the subject), then
    /// auto-provision with empty access when the tenant allows it.
    fn resolve_enterprise_user(
        &self,
        tenant_id: Uuid,
        verified: &VerifiedToken,
    ) -> Result<crate::types::User> {
        if let Some(user) = self.store.by_subject(tenant_id, &verified.subject)? {
            return Ok(user);
        }
        if let Some(user) = self.store.by_email(tenant_id, &verified.email)? {
            debug!(user_id = %user.id, "binding external subject to existing user");
            self.store.attach_subject(user.id, &verified.subject)?;
            return Ok(user);
        }
        if !self.auto_provision {
            return Err(IdentityError::AuthFailed(
                "unknown user and auto-provision disabled".into(),
            ));
        }
        let display_name = verified
            .display_name
            .clone()
            .unwrap_or_else(|| verified.email.clone());
        self.store.provision(
            tenant_id,
            &verified.email,
            &display_name,
            Some(&verified.subject),
        )
    }

    /// Exchange an authorization code at the IdP for an access token
    /// (enterprise auth-callback flow).
    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let url = format!("{}/oauth2/token", self.enterprise_base);
        let resp = self
            .http
            .post(&url)
            .form(&[("grant_type", "authorization_code"), ("code", code)])
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(IdentityError::AuthFailed("code exchange rejected".into()));
        }
        #[derive(Deserialize)]
        struct TokenExchange {
            access_token: String,
        }
        let body: TokenExchange = resp
            .json()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        Ok(body.access_token)
    }

    // ── consumer sessions ────────────────────────────────────────────────────

    /// Issue an opaque session token: `user_id.issued_at.hmac`.
    pub fn issue_session(&self, user_id: Uuid) -> String {
        let issued_at = Utc::now().timestamp();
        let payload = format!("{}.{}", user_id, issued_at);
        let mut mac = HmacSha256::new_from_slice(&self.session_secret)
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{}.{}", payload, sig)
    }

    /// Verify a session token's signature and age.
    pub fn verify_session(&self, token: &str) -> Result<Uuid> {
        let mut parts = token.splitn(3, '.');
        let (user_id, issued_at, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(t), Some(s)) => (u, t, s),
            _ => return Err(IdentityError::AuthFailed("malformed session token".into())),
        };

        let payload = format!("{}.{}", user_id, issued_at);
        let mut mac = HmacSha256::new_from_slice(&self.session_secret)
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let sig_bytes =
            hex::decode(sig).map_err(|_| IdentityError::AuthFailed("bad signature".into()))?;
        mac.verify_slice(&sig_bytes)
            .map_err(|_| IdentityError::AuthFailed("bad signature".into()))?;

        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| IdentityError::AuthFailed("bad timestamp".into()))?;
        if Utc::now().timestamp() - issued_at > SESSION_MAX_AGE_SECS {
            return Err(IdentityError::AuthFailed("session expired".into()));
        }

        Uuid::parse_str(user_id).map_err(|_| IdentityError::AuthFailed("bad user id".into()))
    }

    /// Consumer password login. Returns a session token on success.
    pub fn login_password(&self, tenant_id: Uuid, email: &str, password: &str) -> Result<String> {
        let user = self
            .store
            .by_email(tenant_id, email)?
            .ok_or_else(|| IdentityError::AuthFailed("unknown user".into()))?;
        if !user.is_active {
            return Err(IdentityError::Inactive);
        }
        let hash = user
            .password_hash
            .as_deref()
            .ok_or_else(|| IdentityError::AuthFailed("password login not enabled".into()))?;
        let parsed = PasswordHash::new(hash)
            .map_err(|_| IdentityError::AuthFailed("stored hash invalid".into()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| IdentityError::AuthFailed("wrong password".into()))?;
        Ok(self.issue_session(user.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::sync::Arc;

    fn authenticator() -> (Authenticator, Arc<UserStore>) {
        let store = Arc::new(UserStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let auth = Authenticator::new(
            Arc::clone(&store),
            "https://idp.invalid",
            "0123456789abcdef0123456789abcdef",
            true,
        );
        (auth, store)
    }

    #[test]
    fn session_round_trip() {
        let (auth, _store) = authenticator();
        let user_id = Uuid::new_v4();
        let token = auth.issue_session(user_id);
        assert_eq!(auth.verify_session(&token).unwrap(), user_id);
    }

    #[test]
    fn tampered_session_rejected() {
        let (auth, _store) = authenticator();
        let token = auth.issue_session(Uuid::new_v4());
        let mut tampered = token.clone();
        // flip a character in the signature
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(auth.verify_session(&tampered).is_err());
    }

    #[test]
    fn session_signed_with_other_secret_rejected() {
        let (auth, store) = authenticator();
        let other = Authenticator::new(
            store,
            "https://idp.invalid",
            "ffffffffffffffffffffffffffffffff",
            true,
        );
        let token = other.issue_session(Uuid::new_v4());
        assert!(auth.verify_session(&token).is_err());
    }

    #[tokio::test]
    async fn inactive_user_fails_even_with_valid_session() {
        let (auth, store) = authenticator();
        let tenant = Uuid::new_v4();
        let user = store.provision(tenant, "a@x.com", "A", None).unwrap();
        store.set_active(user.id, false).unwrap();

        let token = auth.issue_session(user.id);
        let err = auth
            .authenticate(&token, tenant, TenantMode::Consumer)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Inactive));
    }

    #[tokio::test]
    async fn session_for_wrong_tenant_rejected() {
        let (auth, store) = authenticator();
        let user = store
            .provision(Uuid::new_v4(), "a@x.com", "A", None)
            .unwrap();
        let token = auth.issue_session(user.id);
        let err = auth
            .authenticate(&token, Uuid::new_v4(), TenantMode::Consumer)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::AuthFailed(_)));
    }
}
