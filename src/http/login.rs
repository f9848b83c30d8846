//! Brute force protection for a login endpoint and a reference handler.
//!
//! A login attempt passes three gates in order: the account lockout, then
//! the per-email and per-address limits as one compound check. Failed
//! credentials count toward the lockout; a success clears the email limit
//! and the lockout but leaves the address limit in place so one attacker
//! cannot reset it by logging into their own account between guesses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client_ip::ClientIp;
use super::response::{apply_rate_limit_headers, error_response, AccountLocked, RateLimited};
use crate::config::{AccountEntry, GuardSettings};
use crate::error::{GuardError, Result};
use crate::lockout::{AccountLockout, LockoutStatus};
use crate::ratelimit::{compound_check, select_backend, LimitConfig, Limiter, LimiterCheck, RateLimitInfo};

pub const EMAIL_PREFIX: &str = "login:email";
pub const IP_PREFIX: &str = "login:ip";
pub const LOCKOUT_PREFIX: &str = "login:lockout";

const RATE_LIMITED_MESSAGE: &str = "Too many login attempts. Please try again later.";

/// Why a login attempt was turned away before or after verification.
#[derive(Debug, Clone)]
pub enum LoginRejection {
    /// The account is locked
    Locked(LockoutStatus),
    /// The email or address limit is exhausted
    RateLimited(RateLimitInfo),
}

impl IntoResponse for LoginRejection {
    fn into_response(self) -> Response {
        match self {
            LoginRejection::Locked(status) => AccountLocked { status }.into_response(),
            LoginRejection::RateLimited(info) => {
                RateLimited::new(info, RATE_LIMITED_MESSAGE).into_response()
            }
        }
    }
}

/// The limiters and lockout tracker guarding one login endpoint.
pub struct LoginProtection {
    email: Arc<dyn Limiter>,
    ip: Arc<dyn Limiter>,
    lockout: AccountLockout,
}

impl LoginProtection {
    pub fn new(email: Arc<dyn Limiter>, ip: Arc<dyn Limiter>, lockout: AccountLockout) -> Self {
        Self { email, ip, lockout }
    }

    /// Build the email and address limiters on the configured backend and a
    /// lockout tracker from `settings.login`.
    pub async fn from_settings(settings: &GuardSettings) -> Self {
        let email = select_backend(settings.login.email_limit(), EMAIL_PREFIX, settings).await;
        let ip = select_backend(settings.login.ip_limit(), IP_PREFIX, settings).await;
        let lockout = AccountLockout::with_clock(
            settings.login.lockout(),
            LOCKOUT_PREFIX,
            Arc::new(crate::clock::SystemClock),
            settings.sweep_interval(),
        );

        if settings.login.development {
            warn!("Login protection running with development limits");
        }

        Self::new(Arc::new(email), Arc::new(ip), lockout)
    }

    /// Gate an attempt before credentials are verified.
    ///
    /// The lockout is consulted first so a locked account never reaches the
    /// limiters or verification. On success the returned info describes the
    /// strictest of the two limits.
    pub async fn precheck(
        &self,
        email: &str,
        ip: &str,
    ) -> std::result::Result<RateLimitInfo, LoginRejection> {
        let status = self.lockout.check(email);
        if status.locked {
            warn!(
                email = %email,
                seconds_until_unlock = status.seconds_until_unlock(),
                "Login attempt on locked account"
            );
            return Err(LoginRejection::Locked(status));
        }

        let info = compound_check(&[
            LimiterCheck::new(self.email.as_ref(), email),
            LimiterCheck::new(self.ip.as_ref(), ip),
        ])
        .await;

        if !info.allowed {
            warn!(
                email = %email,
                ip = %ip,
                retry_after = info.retry_after_secs(),
                "Login rate limited"
            );
            return Err(LoginRejection::RateLimited(info));
        }

        Ok(info)
    }

    /// Count a failed verification. Returns the rejection when this failure
    /// locks the account.
    pub fn record_failure(&self, email: &str) -> std::result::Result<LockoutStatus, LoginRejection> {
        let status = self.lockout.record_failure(email);
        if status.locked {
            return Err(LoginRejection::Locked(status));
        }
        Ok(status)
    }

    /// Reset the email limit and the lockout after a successful login.
    pub async fn record_success(&self, email: &str) {
        self.email.clear(email).await;
        self.lockout.record_success(email);
    }

    pub fn email_limit(&self) -> LimitConfig {
        self.email.config()
    }

    pub fn ip_limit(&self) -> LimitConfig {
        self.ip.config()
    }

    pub fn lockout(&self) -> &AccountLockout {
        &self.lockout
    }

    /// Stop every background task.
    pub async fn stop(&self) {
        self.email.stop().await;
        self.ip.stop().await;
        self.lockout.stop().await;
    }
}

/// Checks a password for an identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Whether `password` is correct for `email`. Unknown identities are
    /// simply `false`.
    async fn verify(&self, email: &str, password: &str) -> bool;
}

/// Password used to build the hash compared against for unknown identities.
const DUMMY_PASSWORD: &str = "authguard-dummy-password";

/// Accounts with bcrypt password hashes held in memory.
#[derive(Clone)]
pub struct StaticAccounts {
    hashes: Arc<HashMap<String, String>>,
    dummy_hash: Arc<str>,
}

impl StaticAccounts {
    /// Index `accounts` by normalized email. The dummy hash uses the cost of
    /// the first configured hash so misses take as long as hits.
    pub fn new(accounts: &[AccountEntry]) -> Result<Self> {
        let hashes: HashMap<String, String> = accounts
            .iter()
            .map(|account| (normalize_email(&account.email), account.password_hash.clone()))
            .collect();

        let cost = accounts
            .first()
            .and_then(|account| hash_cost(&account.password_hash))
            .unwrap_or(bcrypt::DEFAULT_COST);
        let dummy_hash = bcrypt::hash(DUMMY_PASSWORD, cost)
            .map_err(|e| GuardError::Config(format!("Failed to prepare password hashing: {}", e)))?;

        Ok(Self {
            hashes: Arc::new(hashes),
            dummy_hash: Arc::from(dummy_hash),
        })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl std::fmt::Debug for StaticAccounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAccounts")
            .field("accounts", &self.hashes.len())
            .finish()
    }
}

/// The cost field of a `$2b$12$...` hash.
fn hash_cost(hash: &str) -> Option<u32> {
    hash.split('$').nth(2)?.parse().ok()
}

#[async_trait]
impl CredentialVerifier for StaticAccounts {
    async fn verify(&self, email: &str, password: &str) -> bool {
        let known = self.hashes.get(email).cloned();
        let password = password.to_string();
        let dummy = self.dummy_hash.clone();
        let email = email.to_string();

        let result = tokio::task::spawn_blocking(move || match known {
            Some(hash) => match bcrypt::verify(&password, &hash) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(email = %email, error = %e, "Stored password hash is invalid");
                    false
                }
            },
            None => {
                let _ = bcrypt::verify(&password, &dummy);
                false
            }
        })
        .await;

        result.unwrap_or(false)
    }
}

/// Trim and lower-case an email so every spelling shares one key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: &'static str,
    pub email: String,
}

/// Shared state of the login route.
#[derive(Clone)]
pub struct LoginState {
    pub protection: Arc<LoginProtection>,
    pub verifier: Arc<dyn CredentialVerifier>,
}

/// `POST /api/auth/login`
pub fn login_router(state: LoginState) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .with_state(state)
}

async fn login(
    State(state): State<LoginState>,
    client: ClientIp,
    Json(request): Json<LoginRequest>,
) -> Response {
    let email = normalize_email(&request.email);
    if email.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Email is required");
    }
    if !is_plausible_email(&email) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid email format");
    }
    if request.password.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Password is required");
    }

    let ip = client.key();
    let info = match state.protection.precheck(&email, &ip).await {
        Ok(info) => info,
        Err(rejection) => return rejection.into_response(),
    };

    if !state.verifier.verify(&email, &request.password).await {
        let mut response = match state.protection.record_failure(&email) {
            Ok(status) => {
                warn!(
                    email = %email,
                    ip = %ip,
                    remaining_attempts = status.remaining_attempts,
                    "Login failed: invalid credentials"
                );
                error_response(StatusCode::UNAUTHORIZED, "Invalid credentials")
            }
            Err(rejection) => {
                warn!(email = %email, ip = %ip, "Account locked after failed login attempts");
                rejection.into_response()
            }
        };
        apply_rate_limit_headers(response.headers_mut(), &info);
        return response;
    }

    state.protection.record_success(&email).await;
    info!(email = %email, ip = %ip, "Login successful");

    let mut response = Json(LoginResponse {
        status: "success",
        email,
    })
    .into_response();
    apply_rate_limit_headers(response.headers_mut(), &info);
    response
}

/// A single `@` with something on both sides and a dot in the domain.
fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}
