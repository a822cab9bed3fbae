//! Ordered credential fallback chain, resolved once and cached until the
//! winning credentials expire.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use termrelay_error::{CredentialAttempt, RelayError};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

mod profile;
mod sources;

pub use profile::{default_credentials_path, parse_profiles, Profile};
pub use sources::{
    EnvironmentSource, InstanceMetadataSource, ProfileFileSource, StaticSource,
    DEFAULT_METADATA_ENDPOINT,
};

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    /// Name of the source that produced these credentials.
    pub source: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
            source: source.into(),
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            source: self.source.clone(),
            access_key_id: redact_key(&self.access_key_id),
            session_token: self.session_token.is_some(),
            expires_at: self.expires_at.map(|at| at.to_string()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &redact_key(&self.access_key_id))
            .field("secret_access_key", &"****")
            .field("session_token", &self.session_token.as_ref().map(|_| "****"))
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

/// Printable description of resolved credentials. Never carries a secret.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialSummary {
    pub source: String,
    pub access_key_id: String,
    pub session_token: bool,
    pub expires_at: Option<String>,
}

fn redact_key(key: &str) -> String {
    let trimmed = key.trim();
    let len = trimmed.len();
    if len <= 8 || !trimmed.is_ascii() {
        return "****".to_string();
    }
    format!("{}...{}", &trimmed[..4], &trimmed[len - 4..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Static,
    Profile,
    Environment,
    InstanceMetadata,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("invalid credentials: {0}")]
    Invalid(String),
    #[error("credentials expired at {0}")]
    Expired(OffsetDateTime),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>>;
}

/// Checks that a candidate actually authenticates before the chain accepts
/// it.
pub trait CredentialVerifier: Send + Sync {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> SourceFuture<'a, Result<(), SourceError>>;
}

/// Accepts every candidate that loads.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CredentialVerifier for AcceptAll {
    fn verify<'a>(&'a self, _: &'a Credentials) -> SourceFuture<'a, Result<(), SourceError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("credential resolution failed after {} attempt(s)", attempts.len())]
pub struct CredentialResolutionError {
    pub attempts: Vec<CredentialAttempt>,
}

impl From<CredentialResolutionError> for RelayError {
    fn from(value: CredentialResolutionError) -> Self {
        RelayError::CredentialResolution {
            attempts: value.attempts,
        }
    }
}

/// Explicit ordered list of sources.
///
/// The first source whose credentials load and verify wins. Its result is
/// cached until `expires_at` passes, then the whole chain runs again on the
/// next call. A failed resolution is not cached and may be retried.
#[derive(Default)]
pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
    cached: RwLock<Option<Credentials>>,
}

impl fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialChain")
            .field("sources", &self.source_names())
            .field("resolved", &self.cached.try_read().ok().and_then(|cached| cached.clone()))
            .finish()
    }
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl CredentialSource + 'static) -> Self {
        self.push(Box::new(source));
        self
    }

    pub fn push(&mut self, source: Box<dyn CredentialSource>) {
        self.sources.push(source);
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Credentials cached by an earlier successful [`resolve`](Self::resolve),
    /// whether or not they have expired since.
    pub async fn resolved(&self) -> Option<Credentials> {
        self.cached.read().await.clone()
    }

    pub async fn resolve(
        &self,
        verifier: &dyn CredentialVerifier,
    ) -> Result<Credentials, CredentialResolutionError> {
        if let Some(credentials) = fresh(&*self.cached.read().await) {
            return Ok(credentials);
        }
        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while this one waited for the lock.
        if let Some(credentials) = fresh(&cached) {
            return Ok(credentials);
        }
        if let Some(stale) = cached.take() {
            tracing::info!(
                source = %stale.source,
                expired_at = ?stale.expires_at,
                "cached credentials expired, resolving again"
            );
        }
        let credentials = self.resolve_uncached(verifier).await?;
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    async fn resolve_uncached(
        &self,
        verifier: &dyn CredentialVerifier,
    ) -> Result<Credentials, CredentialResolutionError> {
        let mut attempts = Vec::new();
        for source in &self.sources {
            match self.try_source(source.as_ref(), verifier).await {
                Ok(credentials) => {
                    tracing::info!(
                        source = source.name(),
                        kind = ?source.kind(),
                        failed_before = attempts.len(),
                        "credentials resolved"
                    );
                    return Ok(credentials);
                }
                Err(err) => {
                    tracing::warn!(source = source.name(), error = %err, "credential source failed");
                    attempts.push(CredentialAttempt {
                        source: source.name().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Err(CredentialResolutionError { attempts })
    }

    async fn try_source(
        &self,
        source: &dyn CredentialSource,
        verifier: &dyn CredentialVerifier,
    ) -> Result<Credentials, SourceError> {
        let mut credentials = source.load().await?;
        if let Some(expires_at) = credentials.expires_at {
            if credentials.is_expired(OffsetDateTime::now_utc()) {
                return Err(SourceError::Expired(expires_at));
            }
        }
        credentials.source = source.name().to_string();
        verifier.verify(&credentials).await?;
        Ok(credentials)
    }
}

fn fresh(cached: &Option<Credentials>) -> Option<Credentials> {
    cached
        .as_ref()
        .filter(|credentials| !credentials.is_expired(OffsetDateTime::now_utc()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Counting {
        inner: StaticSource,
        loads: Arc<AtomicUsize>,
    }

    impl CredentialSource for Counting {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn kind(&self) -> SourceKind {
            self.inner.kind()
        }

        fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load()
        }
    }

    /// Accepts only the listed access key ids.
    struct AllowList(Vec<&'static str>);

    impl CredentialVerifier for AllowList {
        fn verify<'a>(&'a self, credentials: &'a Credentials) -> SourceFuture<'a, Result<(), SourceError>> {
            Box::pin(async move {
                if self.0.contains(&credentials.access_key_id.as_str()) {
                    Ok(())
                } else {
                    Err(SourceError::Invalid("signature rejected".to_string()))
                }
            })
        }
    }

    #[tokio::test]
    async fn falls_back_past_an_invalid_explicit_credential() {
        let chain = CredentialChain::new()
            .with_source(StaticSource::new("AKIDEXPLICIT", "bad-secret"))
            .with_source(EnvironmentSource::from_pairs([
                ("AWS_ACCESS_KEY_ID", "AKIDROLE"),
                ("AWS_SECRET_ACCESS_KEY", "role-secret"),
                ("AWS_SESSION_TOKEN", "role-token"),
            ]));

        let credentials = chain
            .resolve(&AllowList(vec!["AKIDROLE"]))
            .await
            .expect("second source wins");
        assert_eq!(credentials.source, "environment");
        assert_eq!(credentials.session_token.as_deref(), Some("role-token"));
        assert_eq!(
            chain.resolved().await.map(|c| c.source),
            Some("environment".to_string())
        );
    }

    #[tokio::test]
    async fn resolves_once_and_serves_from_cache() {
        let loads = Arc::new(AtomicUsize::new(0));
        let chain = CredentialChain::new().with_source(Counting {
            inner: StaticSource::new("AKIDEXAMPLE", "secret"),
            loads: loads.clone(),
        });

        for _ in 0..3 {
            chain.resolve(&AcceptAll).await.expect("resolve");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    /// Hands out a new key on every load, valid for `ttl`.
    struct Expiring {
        ttl: time::Duration,
        loads: Arc<AtomicUsize>,
    }

    impl CredentialSource for Expiring {
        fn name(&self) -> &str {
            "instance-metadata"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::InstanceMetadata
        }

        fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            let mut credentials =
                Credentials::new(format!("AKIDROLE{n}"), "secret", "").with_session_token("tok");
            credentials.expires_at = Some(OffsetDateTime::now_utc() + self.ttl);
            Box::pin(async move { Ok(credentials) })
        }
    }

    #[tokio::test]
    async fn expired_cache_runs_the_chain_again() {
        let loads = Arc::new(AtomicUsize::new(0));
        let chain = CredentialChain::new().with_source(Expiring {
            ttl: time::Duration::milliseconds(150),
            loads: loads.clone(),
        });

        let first = chain.resolve(&AcceptAll).await.expect("first resolve");
        assert_eq!(first.access_key_id, "AKIDROLE1");
        let cached = chain.resolve(&AcceptAll).await.expect("cached");
        assert_eq!(cached.access_key_id, "AKIDROLE1");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert!(chain
            .resolved()
            .await
            .is_some_and(|stale| stale.is_expired(OffsetDateTime::now_utc())));

        let refreshed = chain.resolve(&AcceptAll).await.expect("refreshed");
        assert_eq!(refreshed.access_key_id, "AKIDROLE2");
        assert!(!refreshed.is_expired(OffsetDateTime::now_utc()));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(
            chain.resolved().await.map(|c| c.access_key_id),
            Some("AKIDROLE2".to_string())
        );
    }

    #[tokio::test]
    async fn exhaustion_lists_every_attempt_in_order() {
        let chain = CredentialChain::new()
            .with_source(StaticSource::unset())
            .with_source(EnvironmentSource::from_pairs::<_, &str, &str>([]));

        let err = chain.resolve(&AcceptAll).await.unwrap_err();
        let sources: Vec<_> = err.attempts.iter().map(|a| a.source.as_str()).collect();
        assert_eq!(sources, vec!["static", "environment"]);
        assert!(chain.resolved().await.is_none());

        let relay: RelayError = err.into();
        assert_eq!(relay.to_problem_details().status, 502);
    }

    #[test]
    fn debug_output_never_shows_secrets() {
        let credentials =
            Credentials::new("AKIDEXAMPLE1234", "wJalrXUtnFEMI", "static").with_session_token("tok");
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("wJalrXUtnFEMI"));
        assert!(!debug.contains("tok\""));
        assert_eq!(credentials.summary().access_key_id, "AKID...1234");
    }
}
