//! Client authentication: an ordered ladder of methods tried in sequence.

use std::{path::PathBuf, sync::Arc};

use russh::{
    client::{self, AuthResult, Handle}, keys::{HashAlg, PrivateKeyWithHashAlg}
};
use secrecy::{ExposeSecret, SecretString};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult}, keys::load_identity
};

/// Inputs for building the authentication ladder.
pub struct AuthConfig {
    pub identity: PathBuf,
    pub password: Option<SecretString>,
}

enum AuthMethod {
    PublicKey(Arc<russh::keys::PrivateKey>),
    Password(SecretString),
    PasswordPrompt,
}

impl AuthMethod {
    fn label(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::PasswordPrompt => "password-prompt",
        }
    }
}

/// Try each configured method in order until the server accepts one.
///
/// The ladder is: public key from the identity file (when it loads), the
/// configured password, then an interactive prompt on the controlling
/// terminal as a last resort.
pub async fn authenticate<H>(session: &mut Handle<H>, username: &str, config: &AuthConfig) -> TunnelResult<()>
where
    H: client::Handler + Send,
{
    let mut methods = Vec::new();
    match load_identity(&config.identity) {
        Ok(key) => methods.push(AuthMethod::PublicKey(Arc::new(key))),
        Err(err) => debug!(identity = %config.identity.display(), %err, "identity unavailable, skipping public-key auth"),
    }
    if let Some(password) = &config.password {
        methods.push(AuthMethod::Password(password.clone()));
    }
    methods.push(AuthMethod::PasswordPrompt);

    let rsa_hash_hint = session.best_supported_rsa_hash().await.unwrap_or(None).flatten();

    for method in methods {
        let label = method.label();
        match attempt(session, username, method, rsa_hash_hint).await {
            Ok(result) if result.success() => {
                info!(method = label, user = username, "authentication succeeded");
                return Ok(());
            }
            Ok(_) => warn!(method = label, "authentication rejected by server"),
            Err(err) => warn!(method = label, error = %err, "authentication attempt failed"),
        }
    }

    Err(TunnelError::Auth(
        "no usable authentication method: every method was rejected by the server".to_string(),
    ))
}

async fn attempt<H>(
    session: &mut Handle<H>,
    username: &str,
    method: AuthMethod,
    rsa_hint: Option<HashAlg>,
) -> TunnelResult<AuthResult>
where
    H: client::Handler + Send,
{
    match method {
        AuthMethod::PublicKey(key) => {
            let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
            session
                .authenticate_publickey(username.to_string(), PrivateKeyWithHashAlg::new(key, hash_alg))
                .await
                .map_err(Into::into)
        }
        AuthMethod::Password(password) => session
            .authenticate_password(username.to_string(), password.expose_secret().to_string())
            .await
            .map_err(Into::into),
        AuthMethod::PasswordPrompt => {
            let password = prompt_for_password(username).await?;
            session
                .authenticate_password(username.to_string(), password.expose_secret().to_string())
                .await
                .map_err(Into::into)
        }
    }
}

async fn prompt_for_password(username: &str) -> TunnelResult<SecretString> {
    let prompt = format!("{username}'s password: ");
    task::spawn_blocking(move || {
        rpassword::prompt_password(prompt)
            .map(|s| SecretString::new(s.into_boxed_str()))
            .map_err(TunnelError::Io)
    })
    .await
    .map_err(|e| TunnelError::Auth(format!("prompt task failed: {e}")))?
}
