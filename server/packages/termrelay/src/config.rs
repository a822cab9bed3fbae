use std::str::FromStr;

use termrelay_credentials::{
    CredentialChain, Credentials, EnvironmentSource, InstanceMetadataSource, ProfileFileSource,
    StaticSource, DEFAULT_METADATA_ENDPOINT,
};
use thiserror::Error;

pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-5-haiku-20241022-v1:0";
pub const DEFAULT_PROFILE: &str = "bedrock";
const DEFAULT_MODEL_ENDPOINT: &str = "https://bedrock-runtime.{region}.amazonaws.com";
const DEFAULT_CONTROL_ENDPOINT: &str = "https://bedrock.{region}.amazonaws.com";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.9;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}=`{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key} is set but {missing} is not")]
    Incomplete {
        key: &'static str,
        missing: &'static str,
    },
}

/// How the relay hands model output to the HTTP client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvokeMode {
    #[default]
    ResponseStream,
    Buffered,
}

impl FromStr for InvokeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RESPONSE_STREAM" => Ok(Self::ResponseStream),
            "BUFFERED" => Ok(Self::Buffered),
            other => Err(format!("expected RESPONSE_STREAM or BUFFERED, got {other}")),
        }
    }
}

/// Relay settings, read once at process start.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub region: String,
    pub model_endpoint: String,
    pub control_endpoint: String,
    pub model_id: String,
    pub explicit_credentials: Option<Credentials>,
    pub invoke_mode: InvokeMode,
    pub max_tokens: u32,
    pub temperature: f32,
    pub profile: String,
    pub metadata_endpoint: String,
    pub log_http: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            model_endpoint: expand_region(DEFAULT_MODEL_ENDPOINT, DEFAULT_REGION),
            control_endpoint: expand_region(DEFAULT_CONTROL_ENDPOINT, DEFAULT_REGION),
            model_id: DEFAULT_MODEL_ID.to_string(),
            explicit_credentials: None,
            invoke_mode: InvokeMode::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            profile: DEFAULT_PROFILE.to_string(),
            metadata_endpoint: DEFAULT_METADATA_ENDPOINT.to_string(),
            log_http: false,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let region = get("TERMRELAY_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let model_endpoint = endpoint(
            "TERMRELAY_MODEL_ENDPOINT",
            get("TERMRELAY_MODEL_ENDPOINT").as_deref(),
            DEFAULT_MODEL_ENDPOINT,
            &region,
        )?;
        let control_endpoint = endpoint(
            "TERMRELAY_CONTROL_ENDPOINT",
            get("TERMRELAY_CONTROL_ENDPOINT").as_deref(),
            DEFAULT_CONTROL_ENDPOINT,
            &region,
        )?;

        let explicit_credentials = match (
            get("TERMRELAY_ACCESS_KEY_ID"),
            get("TERMRELAY_SECRET_ACCESS_KEY"),
        ) {
            (Some(key), Some(secret)) => {
                let mut credentials = Credentials::new(key, secret, "static");
                credentials.session_token = get("TERMRELAY_SESSION_TOKEN");
                Some(credentials)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Incomplete {
                    key: "TERMRELAY_ACCESS_KEY_ID",
                    missing: "TERMRELAY_SECRET_ACCESS_KEY",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete {
                    key: "TERMRELAY_SECRET_ACCESS_KEY",
                    missing: "TERMRELAY_ACCESS_KEY_ID",
                })
            }
        };

        let invoke_mode = match get("TERMRELAY_INVOKE_MODE") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                key: "TERMRELAY_INVOKE_MODE",
                value: value.clone(),
                reason,
            })?,
            None => InvokeMode::default(),
        };

        let max_tokens = match get("TERMRELAY_MAX_TOKENS") {
            Some(value) => match value.parse::<u32>() {
                Ok(parsed) if parsed > 0 => parsed,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "TERMRELAY_MAX_TOKENS",
                        value,
                        reason: "expected a positive integer".to_string(),
                    })
                }
            },
            None => DEFAULT_MAX_TOKENS,
        };

        let temperature = match get("TERMRELAY_TEMPERATURE") {
            Some(value) => match value.parse::<f32>() {
                Ok(parsed) if (0.0..=1.0).contains(&parsed) => parsed,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "TERMRELAY_TEMPERATURE",
                        value,
                        reason: "expected a number between 0 and 1".to_string(),
                    })
                }
            },
            None => DEFAULT_TEMPERATURE,
        };

        let log_http = match get("TERMRELAY_LOG_HTTP") {
            Some(value) => !(value == "0" || value.eq_ignore_ascii_case("false")),
            None => false,
        };

        Ok(Self {
            model_endpoint,
            control_endpoint,
            model_id: get("TERMRELAY_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            explicit_credentials,
            invoke_mode,
            max_tokens,
            temperature,
            profile: get("TERMRELAY_PROFILE").unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
            metadata_endpoint: get("TERMRELAY_METADATA_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_METADATA_ENDPOINT.to_string()),
            log_http,
            region,
        })
    }

    /// Explicit pair, then the named profile, then the role provided through
    /// the environment, then the role attached to the host.
    pub fn credential_chain(&self) -> CredentialChain {
        let explicit = match &self.explicit_credentials {
            Some(credentials) => StaticSource::from_credentials(credentials.clone()),
            None => StaticSource::unset(),
        };
        CredentialChain::new()
            .with_source(explicit)
            .with_source(ProfileFileSource::new(self.profile.clone()))
            .with_source(EnvironmentSource::from_env())
            .with_source(InstanceMetadataSource::new(self.metadata_endpoint.clone()))
    }
}

fn expand_region(template: &str, region: &str) -> String {
    template
        .replace("{region}", region)
        .trim_end_matches('/')
        .to_string()
}

fn endpoint(
    key: &'static str,
    configured: Option<&str>,
    default: &str,
    region: &str,
) -> Result<String, ConfigError> {
    let expanded = expand_region(configured.unwrap_or(default), region);
    match url::Url::parse(&expanded) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(expanded),
        Ok(parsed) => Err(ConfigError::Invalid {
            key,
            value: expanded.clone(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        }),
        Err(err) => Err(ConfigError::Invalid {
            key,
            value: expanded,
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_hosted_model() {
        let config = RelayConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.region, "us-west-2");
        assert_eq!(
            config.model_endpoint,
            "https://bedrock-runtime.us-west-2.amazonaws.com"
        );
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.invoke_mode, InvokeMode::ResponseStream);
        assert!(config.explicit_credentials.is_none());
        assert!(!config.log_http);
    }

    #[test]
    fn region_is_substituted_into_endpoint_templates() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("TERMRELAY_REGION", "eu-central-1"),
            ("TERMRELAY_CONTROL_ENDPOINT", "http://localhost:9000/{region}/"),
            ("TERMRELAY_INVOKE_MODE", "buffered"),
            ("TERMRELAY_LOG_HTTP", "1"),
        ]))
        .expect("config");
        assert_eq!(
            config.model_endpoint,
            "https://bedrock-runtime.eu-central-1.amazonaws.com"
        );
        assert_eq!(config.control_endpoint, "http://localhost:9000/eu-central-1");
        assert_eq!(config.invoke_mode, InvokeMode::Buffered);
        assert!(config.log_http);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = RelayConfig::from_lookup(lookup(&[("TERMRELAY_TEMPERATURE", "1.5")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TERMRELAY_TEMPERATURE",
                ..
            }
        ));

        let err = RelayConfig::from_lookup(lookup(&[("TERMRELAY_MODEL_ENDPOINT", "ftp://x")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TERMRELAY_MODEL_ENDPOINT",
                ..
            }
        ));
    }

    #[test]
    fn explicit_pair_must_be_complete() {
        let err = RelayConfig::from_lookup(lookup(&[("TERMRELAY_ACCESS_KEY_ID", "AKID")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Incomplete {
                key: "TERMRELAY_ACCESS_KEY_ID",
                missing: "TERMRELAY_SECRET_ACCESS_KEY",
            }
        );

        let config = RelayConfig::from_lookup(lookup(&[
            ("TERMRELAY_ACCESS_KEY_ID", "AKID"),
            ("TERMRELAY_SECRET_ACCESS_KEY", "secret"),
        ]))
        .expect("config");
        let explicit = config.explicit_credentials.expect("explicit pair");
        assert_eq!(explicit.source, "static");
        assert_eq!(explicit.session_token, None);
    }

    #[test]
    fn chain_orders_sources_explicit_first() {
        let chain = RelayConfig::default().credential_chain();
        assert_eq!(
            chain.source_names(),
            vec!["static", "profile", "environment", "instance-metadata"]
        );
    }
}
