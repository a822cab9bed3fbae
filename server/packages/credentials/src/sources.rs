use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::profile::{default_credentials_path, parse_profiles};
use crate::{CredentialSource, Credentials, SourceError, SourceFuture, SourceKind};

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
const METADATA_TOKEN_TTL: &str = "21600";
const ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";

/// Credentials supplied by explicit configuration.
#[derive(Debug, Clone)]
pub struct StaticSource {
    credentials: Option<Credentials>,
}

impl StaticSource {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            credentials: Some(Credentials::new(access_key_id, secret_access_key, "static")),
        }
    }

    pub fn from_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    /// A slot with nothing configured; always reports `NotConfigured`.
    pub fn unset() -> Self {
        Self { credentials: None }
    }
}

impl CredentialSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
        let result = self
            .credentials
            .clone()
            .ok_or_else(|| SourceError::NotConfigured("no explicit credentials".to_string()));
        Box::pin(async move { result })
    }
}

/// Named profile in a shared credentials file.
#[derive(Debug, Clone)]
pub struct ProfileFileSource {
    path: Option<PathBuf>,
    profile: String,
}

impl ProfileFileSource {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            path: default_credentials_path(),
            profile: profile.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn read(&self) -> Result<Credentials, SourceError> {
        let Some(path) = &self.path else {
            return Err(SourceError::NotConfigured(
                "no home directory for the shared credentials file".to_string(),
            ));
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotConfigured(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let profiles = parse_profiles(&contents);
        let profile = profiles.get(&self.profile).ok_or_else(|| {
            SourceError::NotConfigured(format!("profile `{}` not found", self.profile))
        })?;
        let field = |key: &str| {
            profile.get(key).map(str::to_string).ok_or_else(|| {
                SourceError::Invalid(format!("profile `{}` is missing {key}", self.profile))
            })
        };
        let mut credentials = Credentials::new(
            field("aws_access_key_id")?,
            field("aws_secret_access_key")?,
            "profile",
        );
        credentials.session_token = profile.get("aws_session_token").map(str::to_string);
        Ok(credentials)
    }
}

impl CredentialSource for ProfileFileSource {
    fn name(&self) -> &str {
        "profile"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Profile
    }

    fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
        Box::pin(async move { self.read() })
    }
}

/// Role credentials provided through the process environment. The
/// environment is read once, when the source is built.
#[derive(Debug, Clone)]
pub struct EnvironmentSource {
    captured: Result<Credentials, String>,
}

impl EnvironmentSource {
    pub fn from_env() -> Self {
        Self::from_pairs(
            ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_SESSION_TOKEN"]
                .into_iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| (key, value))),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();
        let captured = match (vars.get("AWS_ACCESS_KEY_ID"), vars.get("AWS_SECRET_ACCESS_KEY")) {
            (Some(key), Some(secret)) => {
                let mut credentials = Credentials::new(key.clone(), secret.clone(), "environment");
                credentials.session_token = vars.get("AWS_SESSION_TOKEN").cloned();
                Ok(credentials)
            }
            (None, _) => Err("AWS_ACCESS_KEY_ID is not set".to_string()),
            (_, None) => Err("AWS_SECRET_ACCESS_KEY is not set".to_string()),
        };
        Self { captured }
    }
}

impl CredentialSource for EnvironmentSource {
    fn name(&self) -> &str {
        "environment"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Environment
    }

    fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
        let result = self.captured.clone().map_err(SourceError::NotConfigured);
        Box::pin(async move { result })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<String>,
}

/// Credentials of the role attached to the host, read from the instance
/// metadata service (session-token protected).
#[derive(Debug, Clone)]
pub struct InstanceMetadataSource {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for InstanceMetadataSource {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_ENDPOINT)
    }
}

impl InstanceMetadataSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self) -> Result<Credentials, SourceError> {
        let unavailable = |err: reqwest::Error| SourceError::Unavailable(err.to_string());

        let token = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", METADATA_TOKEN_TTL)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)?;

        let roles = self
            .client
            .get(format!("{}{ROLE_PATH}", self.endpoint))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| SourceError::NotConfigured("no role attached to this host".to_string()))?;

        let body: RoleCredentials = self
            .client
            .get(format!("{}{ROLE_PATH}{role}", self.endpoint))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?
            .json()
            .await
            .map_err(|err| SourceError::Invalid(err.to_string()))?;

        let mut credentials =
            Credentials::new(body.access_key_id, body.secret_access_key, "instance-metadata");
        credentials.session_token = body.token;
        credentials.expires_at = match body.expiration {
            Some(raw) => Some(
                OffsetDateTime::parse(&raw, &Rfc3339)
                    .map_err(|err| SourceError::Invalid(format!("bad expiration `{raw}`: {err}")))?,
            ),
            None => None,
        };
        tracing::debug!(role = role, "instance role credentials fetched");
        Ok(credentials)
    }
}

impl CredentialSource for InstanceMetadataSource {
    fn name(&self) -> &str {
        "instance-metadata"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::InstanceMetadata
    }

    fn load(&self) -> SourceFuture<'_, Result<Credentials, SourceError>> {
        Box::pin(self.fetch())
    }
}
