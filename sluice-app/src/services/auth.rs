use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use miette::Diagnostic;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use sluice_model::{RateLimits, ServerConfig, User, UserStatus};
use sluice_store::{Registry, Tsdb};

#[derive(Debug, Error, Diagnostic)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("session not found or superseded")]
    NoSession,

    #[error("authentication challenge expired or missing")]
    ChallengeExpired,

    #[error("signature verification failed")]
    BadSignature,

    #[error("static login is disabled")]
    StaticLoginDisabled,

    #[error("registry error during auth")]
    Registry(#[from] sluice_store::RegistryError),

    #[error("user store error during auth")]
    Store(#[from] sluice_store::StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    adm: bool,
    exp: i64,
}

/// Pluggable wallet-signature verification. The cryptography itself
/// (EVM/Solana/Sui) lives outside this crate; the built-in verifier only
/// accepts the HMAC-style scheme used with the static token.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, address: &str, challenge: &str, signature: &str) -> bool;
}

/// Accepts `sha256(challenge | static_token)` hex. Suitable for tests and
/// trusted internal tooling only.
pub struct StaticVerifier {
    token: String,
}

impl SignatureVerifier for StaticVerifier {
    fn verify(&self, _address: &str, challenge: &str, signature: &str) -> bool {
        if self.token.is_empty() {
            return false;
        }
        let expected = Sha256::digest(format!("{challenge}|{}", self.token).as_bytes());
        signature.eq_ignore_ascii_case(&format!("{expected:x}"))
    }
}

/// Session issuance and principal resolution over the registry-backed
/// session store and the `sys.users` update table.
pub struct AuthService {
    registry: Registry,
    tsdb: Arc<dyn Tsdb>,
    jwt_secret: String,
    static_token: String,
    session_ttl_s: u64,
    default_limits: RateLimits,
    verifier: Box<dyn SignatureVerifier>,
}

impl AuthService {
    pub fn new(registry: Registry, tsdb: Arc<dyn Tsdb>, config: &ServerConfig) -> AuthService {
        AuthService {
            registry,
            tsdb,
            jwt_secret: config.jwt_secret.clone(),
            static_token: config.static_auth_token.clone(),
            session_ttl_s: config.session_ttl_s,
            default_limits: config.default_rate_limits,
            verifier: Box::new(StaticVerifier {
                token: config.static_auth_token.clone(),
            }),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> AuthService {
        self.verifier = verifier;
        self
    }

    /// Resolve the request principal: bearer token if present and valid,
    /// else an IP-derived anonymous user (with any persisted counters).
    pub async fn resolve(&self, bearer: Option<&str>, ip: &str) -> User {
        if let Some(token) = bearer {
            match self.user_from_token(token).await {
                Ok(user) => return user,
                Err(e) => debug!("bearer resolution failed, falling back to ip: {e}"),
            }
        }
        let anon = User::anonymous_from_ip(ip, self.default_limits);
        self.hydrate(anon).await
    }

    async fn user_from_token(&self, token: &str) -> Result<User, AuthError> {
        let claims = self.decode_token(token)?;
        let session = self
            .registry
            .get_str(&format!("session:{}", claims.sub))
            .await?;
        if session.as_deref() != Some(token) {
            return Err(AuthError::NoSession);
        }
        let mut user = match self
            .tsdb
            .fetch_by_id(sluice_model::USERS_TABLE, &claims.sub)
            .await?
        {
            Some(record) => User::from_record(&record, self.default_limits)
                .unwrap_or_else(|| User::from_wallet(&claims.sub, self.default_limits)),
            None => {
                let mut user = User::anonymous_from_ip("0.0.0.0", self.default_limits);
                user.uid = claims.sub.clone();
                user
            }
        };
        if claims.adm {
            user.status = UserStatus::Admin;
        } else if user.status == UserStatus::Anonymous {
            user.status = UserStatus::Public;
        }
        user.session_token = Some(token.to_string());
        user.session_expires_at =
            chrono::DateTime::from_timestamp(claims.exp, 0);
        Ok(user)
    }

    /// Load persisted counters and status for a freshly-derived user.
    async fn hydrate(&self, user: User) -> User {
        match self
            .tsdb
            .fetch_by_id(sluice_model::USERS_TABLE, &user.uid)
            .await
        {
            Ok(Some(record)) => {
                let mut stored =
                    User::from_record(&record, self.default_limits).unwrap_or(user.clone());
                if stored.status == UserStatus::Public && user.status == UserStatus::Anonymous {
                    stored.status = UserStatus::Anonymous;
                }
                stored
            }
            Ok(None) => user,
            Err(e) => {
                warn!("user hydration failed for {}: {e}", user.uid);
                user
            }
        }
    }

    fn encode_token(&self, uid: &str, admin: bool) -> Result<String, AuthError> {
        let claims = Claims {
            sub: uid.to_string(),
            adm: admin,
            exp: (Utc::now() + Duration::seconds(self.session_ttl_s as i64)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|_| AuthError::InvalidToken)
    }

    fn decode_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)
    }

    /// Static-token login: grants an admin session.
    pub async fn login_static(&self, token: &str) -> Result<String, AuthError> {
        if self.static_token.is_empty() {
            return Err(AuthError::StaticLoginDisabled);
        }
        if token != self.static_token {
            return Err(AuthError::InvalidToken);
        }
        let uid = "admin";
        let jwt = self.encode_token(uid, true)?;
        self.registry
            .set_str(&format!("session:{uid}"), &jwt, self.session_ttl_s)
            .await?;
        Ok(jwt)
    }

    /// Create a short-lived signing challenge for a wallet address.
    pub async fn create_challenge(&self, address: &str) -> Result<String, AuthError> {
        let nonce: u128 = rand::thread_rng().r#gen();
        let challenge = format!("sluice-auth:{address}:{nonce:032x}");
        let user = User::from_wallet(address, self.default_limits);
        self.registry
            .set_str(&format!("challenge:{}", user.uid), &challenge, 300)
            .await?;
        Ok(challenge)
    }

    /// Complete challenge auth: verify the signature, persist the user,
    /// and open a session.
    pub async fn verify_challenge(
        &self,
        address: &str,
        signature: &str,
    ) -> Result<String, AuthError> {
        let mut user = User::from_wallet(address, self.default_limits);
        let key = format!("challenge:{}", user.uid);
        let challenge = self
            .registry
            .get_str(&key)
            .await?
            .ok_or(AuthError::ChallengeExpired)?;
        if !self.verifier.verify(address, &challenge, signature) {
            return Err(AuthError::BadSignature);
        }
        self.registry.del(&key).await?;

        user = self.hydrate(user).await;
        self.persist(&user).await?;

        let jwt = self.encode_token(&user.uid, user.is_admin())?;
        self.registry
            .set_str(&format!("session:{}", user.uid), &jwt, self.session_ttl_s)
            .await?;
        Ok(jwt)
    }

    pub async fn logout(&self, uid: &str) -> Result<(), AuthError> {
        self.registry.del(&format!("session:{uid}")).await?;
        Ok(())
    }

    /// Write the user's counters through the update-table contract.
    pub async fn persist(&self, user: &User) -> Result<(), AuthError> {
        let mut ing = User::users_ingester();
        for (name, value) in user.to_record() {
            ing.set_value(&name, value);
        }
        self.tsdb.upsert(&ing, None).await?;
        Ok(())
    }

    /// Post-response usage tracking; failures only log.
    pub async fn track_usage(&self, mut user: User, path: &str, bytes: i64) {
        user.update_usage(path, bytes);
        if let Err(e) = self.persist(&user).await {
            warn!("usage tracking failed for {}: {e}", user.uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_verifier_accepts_the_hmac_scheme() {
        let verifier = StaticVerifier {
            token: "hunter2".into(),
        };
        let challenge = "sluice-auth:0xabc:00000000000000000000000000000001";
        let signature = format!(
            "{:x}",
            Sha256::digest(format!("{challenge}|hunter2").as_bytes())
        );
        assert!(verifier.verify("0xabc", challenge, &signature));
        assert!(!verifier.verify("0xabc", challenge, "deadbeef"));

        let disabled = StaticVerifier {
            token: String::new(),
        };
        assert!(!disabled.verify("0xabc", challenge, &signature));
    }
}
