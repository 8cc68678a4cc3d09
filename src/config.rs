//! Service configuration.
//!
//! Everything is read from the environment (a `.env` file is loaded first by
//! `main`). WhatsApp credentials are required; dispatch pacing and the bind
//! address have defaults.

use crate::dispatcher::{
    DispatchOptions, DEFAULT_GROUP_SIZE, DEFAULT_INTER_GROUP_DELAY, DEFAULT_SEND_TIMEOUT,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_API_VERSION: &str = "v21.0";
const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Credentials and endpoints for the WhatsApp Cloud API.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub waba_id: String,
    pub api_version: String,
    pub graph_url: String,
    /// Link sent for templates whose header is an image.
    pub default_header_image_url: Option<String>,
}

impl WhatsAppConfig {
    /// `{graph_url}/{api_version}`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!(
            "{}/{}",
            self.graph_url.trim_end_matches('/'),
            self.api_version
        )
    }
}

/// Group size, pacing and timeout for batch sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSettings {
    pub group_size: usize,
    pub delay_ms: u64,
    /// 0 disables the per-send timeout.
    pub send_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            delay_ms: DEFAULT_INTER_GROUP_DELAY.as_millis() as u64,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DispatchSettings {
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            group_size: self.group_size,
            inter_group_delay: Duration::from_millis(self.delay_ms),
            send_timeout: (self.send_timeout_ms > 0)
                .then(|| Duration::from_millis(self.send_timeout_ms)),
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub whatsapp: WhatsAppConfig,
    pub dispatch: DispatchSettings,
    pub bind_addr: String,
}

/// Config view that is safe to return over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub access_token: String,
    pub phone_number_id: String,
    pub waba_id: String,
    pub api_version: String,
    pub base_url: String,
    pub default_header_image_url: Option<String>,
    pub dispatch: DispatchSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).with_context(|| format!("{} environment variable not set", key))
        };

        let whatsapp = WhatsAppConfig {
            access_token: require("WHATSAPP_ACCESS_TOKEN")?,
            phone_number_id: require("WHATSAPP_PHONE_NUMBER_ID")?,
            waba_id: require("META_WABA_ID")?,
            api_version: get("WHATSAPP_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            graph_url: get("WHATSAPP_GRAPH_URL").unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string()),
            default_header_image_url: get("DEFAULT_HEADER_IMAGE_URL"),
        };

        let defaults = DispatchSettings::default();
        let dispatch = DispatchSettings {
            group_size: parse_or(get("DISPATCH_GROUP_SIZE"), "DISPATCH_GROUP_SIZE", defaults.group_size)?,
            delay_ms: parse_or(get("DISPATCH_DELAY_MS"), "DISPATCH_DELAY_MS", defaults.delay_ms)?,
            send_timeout_ms: parse_or(
                get("DISPATCH_SEND_TIMEOUT_MS"),
                "DISPATCH_SEND_TIMEOUT_MS",
                defaults.send_timeout_ms,
            )?,
        };
        if dispatch.group_size == 0 {
            anyhow::bail!("DISPATCH_GROUP_SIZE must be at least 1");
        }

        Ok(Self {
            whatsapp,
            dispatch,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        })
    }

    pub fn summary(&self) -> ConfigSummary {
        let token = &self.whatsapp.access_token;
        let visible: String = token.chars().take(10).collect();
        ConfigSummary {
            access_token: format!("{}...", visible),
            phone_number_id: self.whatsapp.phone_number_id.clone(),
            waba_id: self.whatsapp.waba_id.clone(),
            api_version: self.whatsapp.api_version.clone(),
            base_url: self.whatsapp.base_url(),
            default_header_image_url: self.whatsapp.default_header_image_url.clone(),
            dispatch: self.dispatch,
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("WHATSAPP_ACCESS_TOKEN", "EAAG1234567890abcdef"),
        ("WHATSAPP_PHONE_NUMBER_ID", "1098765"),
        ("META_WABA_ID", "555"),
    ];

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.whatsapp.base_url(), "https://graph.facebook.com/v21.0");
        assert_eq!(config.dispatch, DispatchSettings::default());
        assert_eq!(config.bind_addr, "0.0.0.0:3000");

        let options = config.dispatch.options();
        assert_eq!(options.group_size, 3);
        assert_eq!(options.inter_group_delay, Duration::from_millis(3000));
        assert_eq!(options.send_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_credentials() {
        let err = AppConfig::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert!(err.to_string().contains("META_WABA_ID"));
    }

    #[test]
    fn test_overrides_and_disabled_timeout() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("DISPATCH_GROUP_SIZE", "5"),
            ("DISPATCH_DELAY_MS", "100"),
            ("DISPATCH_SEND_TIMEOUT_MS", "0"),
            ("WHATSAPP_GRAPH_URL", "http://localhost:9000/"),
        ]);
        let config = AppConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.whatsapp.base_url(), "http://localhost:9000/v21.0");
        let options = config.dispatch.options();
        assert_eq!(options.group_size, 5);
        assert_eq!(options.send_timeout, None);
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DISPATCH_DELAY_MS", "soon"));
        let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("DISPATCH_DELAY_MS"));
    }

    #[test]
    fn test_zero_group_size_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DISPATCH_GROUP_SIZE", "0"));
        assert!(AppConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn test_summary_redacts_token() {
        let config = AppConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.summary().access_token, "EAAG123456...");
    }
}
