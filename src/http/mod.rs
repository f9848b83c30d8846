//! HTTP integration: response contract, client addressing, middleware and
//! the login endpoint.

pub mod client_ip;
pub mod layer;
pub mod login;
pub mod response;

pub use client_ip::{extract_ip, ClientIp};
pub use layer::{ClientIpKey, KeyExtractor, RateLimitLayer, RateLimitService};
pub use login::{
    login_router, CredentialVerifier, LoginProtection, LoginRejection, LoginState, StaticAccounts,
};
pub use response::{
    apply_rate_limit_headers, format_reset_time, AccountLocked, RateLimited, TooManyRequests,
};
