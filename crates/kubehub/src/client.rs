//! Clients scoped to a workload's service account.

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::config::AuthInfo;
use kube::{Client, Config};
use secrecy::SecretString;

/// Builds clients that talk to the same cluster as the controller but
/// authenticate with a service-account token.
#[derive(Clone)]
pub struct ClientBuilder {
    base: Config,
}

impl ClientBuilder {
    pub fn new(base: Config) -> Self {
        Self { base }
    }

    /// Controller config with credentials replaced by the secret's token.
    pub fn config_for(&self, secret: &Secret) -> Result<Config> {
        let token = token_from_secret(secret)?;
        let mut cfg = self.base.clone();
        cfg.auth_info = AuthInfo { token: Some(SecretString::new(token)), ..Default::default() };
        Ok(cfg)
    }

    pub fn client_for(&self, secret: &Secret) -> Result<Client> {
        let cfg = self.config_for(secret)?;
        Client::try_from(cfg).context("building client scoped to service account token")
    }
}

fn token_from_secret(secret: &Secret) -> Result<String> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get("token"))
        .ok_or_else(|| anyhow!("secret has no token"))?;
    let token = String::from_utf8(raw.0.clone()).context("token is not utf-8")?;
    if token.trim().is_empty() {
        return Err(anyhow!("secret token is empty"));
    }
    Ok(token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use secrecy::ExposeSecret;
    use std::collections::BTreeMap;

    fn base() -> Config {
        Config::new("https://cluster.local:6443".parse().unwrap())
    }

    fn secret(token: &[u8]) -> Secret {
        Secret { data: Some(BTreeMap::from([("token".to_string(), ByteString(token.to_vec()))])), ..Default::default() }
    }

    #[test]
    fn scoped_config_carries_only_the_token() {
        let mut b = base();
        b.auth_info.username = Some("admin".into());
        let cfg = ClientBuilder::new(b).config_for(&secret(b"sa-token\n")).unwrap();
        assert_eq!(cfg.auth_info.token.as_ref().map(|t| t.expose_secret().as_str()), Some("sa-token"));
        assert!(cfg.auth_info.username.is_none());
        assert_eq!(cfg.cluster_url.host(), Some("cluster.local"));
    }

    #[test]
    fn missing_or_empty_token_fails() {
        let builder = ClientBuilder::new(base());
        assert!(builder.config_for(&Secret::default()).is_err());
        assert!(builder.config_for(&secret(b"  ")).is_err());
    }
}
