use std::collections::HashSet;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Local, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    db::{format_stamp, now_stamp},
    error::ApiError,
    identity::AuthenticatedUser,
    plans::{resolve_tier, Tier},
};

const TOKEN_TTL_DAYS: i64 = 7;
const BCRYPT_COST: u32 = 12;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"));
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]{3,30}$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error("This username is already taken")]
    UsernameTaken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Validation(message) => ApiError::Validation(message),
            AuthError::EmailTaken | AuthError::UsernameTaken => {
                ApiError::Validation(error.to_string())
            }
            AuthError::InvalidCredentials => ApiError::Unauthorized,
            AuthError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub username: String,
    pub exp: i64,
}

/// Issues and verifies bearer tokens. A token is valid only while its
/// session row exists, so logout revokes immediately even though the JWT
/// itself stays decodable until expiry.
#[derive(Clone)]
pub struct AuthService {
    pool: SqlitePool,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    admin_emails: HashSet<String>,
}

impl AuthService {
    pub fn new(pool: SqlitePool, jwt_secret: &str, admin_emails: HashSet<String>) -> Self {
        Self {
            pool,
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            admin_emails,
        }
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<(AuthenticatedUser, String), AuthError> {
        let email = email.trim().to_ascii_lowercase();
        let username = username.trim().to_string();

        if !EMAIL_RE.is_match(&email) {
            return Err(AuthError::Validation("Invalid email address".to_string()));
        }
        if !USERNAME_RE.is_match(&username) {
            return Err(AuthError::Validation(
                "Username must be 3-30 characters (letters, numbers, underscores)".to_string(),
            ));
        }
        if password.len() < 8 {
            return Err(AuthError::Validation(
                "Password must be at least 8 characters".to_string(),
            ));
        }

        let hashed = hash_password(password.to_string()).await?;

        // Uniqueness is enforced by the INSERT; the constraint message
        // distinguishes email from username conflicts.
        let id = Uuid::new_v4().to_string();
        let now = now_stamp();
        let inserted = sqlx::query(
            "INSERT INTO users (id, email, username, password, subscription_tier, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'free', ?5, ?5)",
        )
        .bind(&id)
        .bind(&email)
        .bind(&username)
        .bind(&hashed)
        .bind(&now)
        .execute(&self.pool)
        .await;
        if let Err(error) = inserted {
            return Err(map_unique_violation(error));
        }

        let user = AuthenticatedUser {
            id,
            tier: self.effective_tier(&email, "free"),
            email,
            username,
        };
        let token = self.open_session(&user).await?;

        Ok((user, token))
    }

    /// `identifier` may be an email address or a username.
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(AuthenticatedUser, String), AuthError> {
        let identifier = identifier.trim();

        let row = sqlx::query(
            "SELECT id, email, username, password, subscription_tier FROM users \
             WHERE email = ?1 OR username = ?2",
        )
        .bind(identifier.to_ascii_lowercase())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user")?
        .ok_or(AuthError::InvalidCredentials)?;

        let hashed: String = row.get("password");
        if !verify_password(password.to_string(), hashed).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let email: String = row.get("email");
        let stored_tier: String = row.get("subscription_tier");
        let user = AuthenticatedUser {
            id: row.get("id"),
            tier: self.effective_tier(&email, &stored_tier),
            email,
            username: row.get("username"),
        };
        let token = self.open_session(&user).await?;

        Ok((user, token))
    }

    /// Deletes the session for a token. Unknown tokens are a no-op so
    /// logout never fails client-side.
    pub async fn logout(&self, token: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM user_sessions WHERE token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("failed to delete session")?;
        Ok(())
    }

    /// Full verification: JWT signature and expiry, a live session row,
    /// and a still-existing user. Returns `None` on any failure; callers
    /// decide whether that means 401 or the guest path.
    pub async fn verify_bearer(&self, token: &str) -> Option<AuthenticatedUser> {
        let claims = self.decode_token(token)?;

        let session = sqlx::query(
            "SELECT expires_at FROM user_sessions WHERE token = ?1 AND user_id = ?2",
        )
        .bind(token)
        .bind(&claims.sub)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        let expires_at: String = session.get("expires_at");
        if expires_at <= now_stamp() {
            return None;
        }

        let row = sqlx::query(
            "SELECT id, email, username, subscription_tier FROM users WHERE id = ?1",
        )
        .bind(&claims.sub)
        .fetch_optional(&self.pool)
        .await
        .ok()??;

        let email: String = row.get("email");
        let stored_tier: String = row.get("subscription_tier");
        Some(AuthenticatedUser {
            id: row.get("id"),
            tier: self.effective_tier(&email, &stored_tier),
            email,
            username: row.get("username"),
        })
    }

    /// Signature-only check, no database access. Used where a cheap,
    /// synchronous answer is enough (rate-limit exemptions).
    pub fn decode_token(&self, token: &str) -> Option<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .ok()
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .contains(&email.trim().to_ascii_lowercase())
    }

    /// Stored tier, upgraded to admin when the email is on the operator's
    /// admin list. The list comes from configuration, not the database.
    fn effective_tier(&self, email: &str, stored_tier: &str) -> Tier {
        if self.is_admin_email(email) {
            Tier::Admin
        } else {
            resolve_tier(Some(stored_tier))
        }
    }

    async fn open_session(&self, user: &AuthenticatedUser) -> Result<String, AuthError> {
        let expiry = Utc::now() + ChronoDuration::days(TOKEN_TTL_DAYS);
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            username: user.username.clone(),
            exp: expiry.timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .context("failed to sign token")?;

        let expires_at = format_stamp(
            Local::now().naive_local() + ChronoDuration::days(TOKEN_TTL_DAYS),
        );
        sqlx::query(
            "INSERT INTO user_sessions (id, user_id, token, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&user.id)
        .bind(&token)
        .bind(&expires_at)
        .bind(now_stamp())
        .execute(&self.pool)
        .await
        .context("failed to create session")?;

        Ok(token)
    }
}

fn map_unique_violation(error: sqlx::Error) -> AuthError {
    if let sqlx::Error::Database(db_error) = &error {
        let message = db_error.message();
        if message.contains("users.email") {
            return AuthError::EmailTaken;
        }
        if message.contains("users.username") {
            return AuthError::UsernameTaken;
        }
    }
    AuthError::Internal(anyhow::Error::new(error).context("failed to insert user"))
}

pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

async fn hash_password(password: String) -> Result<String, AuthError> {
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, BCRYPT_COST))
        .await
        .context("password hashing task panicked")?
        .context("failed to hash password")?;
    Ok(hashed)
}

async fn verify_password(password: String, hashed: String) -> Result<bool, AuthError> {
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hashed))
        .await
        .context("password verification task panicked")?
        .context("failed to verify password")?;
    Ok(matches)
}
