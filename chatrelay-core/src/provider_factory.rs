use std::sync::Arc;

use secrecy::SecretString;

use crate::config::{Config, ProviderKind};
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::provider::ChatProvider;
use crate::providers::null::NullProvider;
use crate::providers::openai::OpenAI;

/// Build the configured upstream provider, reading credentials from the process
/// environment.
pub fn build_provider(cfg: &Config) -> CoreResult<Arc<dyn ChatProvider>> {
    build_provider_with(cfg, |k| std::env::var(k).ok())
}

/// Same as [`build_provider`] with an explicit environment lookup.
///
/// Refuses to build an OpenAI provider without an API key, so a gateway never
/// starts in a state where every request would fail upstream.
pub fn build_provider_with<F>(cfg: &Config, lookup: F) -> CoreResult<Arc<dyn ChatProvider>>
where
    F: Fn(&str) -> Option<String>,
{
    match cfg.upstream.provider {
        ProviderKind::Null => {
            tracing::warn!("using the offline null provider; replies are echoes");
            Ok(Arc::new(NullProvider))
        }
        ProviderKind::OpenAI => {
            let env = &cfg.upstream.api_key_env;
            let api_key = lookup(env)
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| RelayError::Config(format!("missing {env}")))?;
            let http = HttpClient::new(&cfg.http)?;
            let provider = OpenAI::new(
                http,
                SecretString::new(api_key.into()),
                cfg.upstream.base_url.clone(),
                cfg.upstream.organization.clone(),
            );
            tracing::info!(base = %cfg.upstream.base_url, model = %cfg.upstream.default_model, "openai provider ready");
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_provider_needs_no_key() {
        let mut cfg = Config::default();
        cfg.upstream.provider = ProviderKind::Null;
        let p = build_provider_with(&cfg, |_| None).unwrap();
        assert_eq!(p.name(), "null");
    }

    #[test]
    fn openai_requires_key() {
        let cfg = Config::default();
        let err = match build_provider_with(&cfg, |_| None) {
            Ok(_) => panic!("expected config error"),
            Err(e) => e,
        };
        match err {
            RelayError::Config(msg) => assert!(msg.contains("OPENAI_API_KEY")),
            other => panic!("expected Config, got: {:?}", other),
        }
    }

    #[test]
    fn openai_reads_configured_env_var() {
        let mut cfg = Config::default();
        cfg.upstream.api_key_env = "RELAY_TEST_KEY".into();
        let p = build_provider_with(&cfg, |k| (k == "RELAY_TEST_KEY").then(|| "sk-test".into()))
            .unwrap();
        assert_eq!(p.name(), "openai");
    }
}
