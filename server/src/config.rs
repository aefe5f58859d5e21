//! Server configuration

use std::time::Duration;

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Kubeconfig for the cluster hosting terminal pods.
    /// Unset means in-cluster config or the local default kubeconfig.
    #[serde(default)]
    pub host_kubeconfig: Option<String>,

    /// Context inside `host_kubeconfig`
    #[serde(default)]
    pub host_context: Option<String>,

    /// Kubeconfig for the control-plane API that callers authenticate against.
    /// Unset means the host cluster is also the control plane.
    #[serde(default)]
    pub api_kubeconfig: Option<String>,

    /// Context inside `api_kubeconfig`
    #[serde(default)]
    pub api_context: Option<String>,

    /// Namespace where personal terminal pods live
    #[serde(default = "default_terminal_namespace")]
    pub terminal_namespace: String,

    /// Image for personal terminal pods
    #[serde(default = "default_terminal_image")]
    pub terminal_image: String,

    /// Service account for personal terminal pods
    #[serde(default = "default_terminal_service_account")]
    pub terminal_service_account: String,

    /// Image pull secrets attached to terminal pods
    #[serde(default)]
    pub terminal_image_pull_secrets: Vec<String>,

    /// Overall deadline for a terminal pod to report Ready, in seconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout: u64,

    /// Interval between readiness checks, in seconds
    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval: u64,

    /// Deadline for a browser to attach to a freshly created session, in seconds
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout: u64,

    /// Shells tried in order when opening an interactive exec
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_terminal_namespace() -> String {
    "karmada-system".to_string()
}

fn default_terminal_image() -> String {
    "tsl0922/ttyd:1.7.4".to_string()
}

fn default_terminal_service_account() -> String {
    "karmada-dashboard".to_string()
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_readiness_poll_interval() -> u64 {
    5
}

fn default_attach_timeout() -> u64 {
    30
}

fn default_shells() -> Vec<String> {
    vec!["bash".to_string(), "sh".to_string()]
}

/// Parse a whole number of seconds, refusing zero
fn positive_secs(val: &str) -> Option<u64> {
    val.trim().parse().ok().filter(|&secs| secs > 0)
}

/// Parse a comma-separated list, dropping empty entries
fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Build configuration from an arbitrary key lookup
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Start with default config as base
        let mut config = Config::default();

        if let Some(val) = lookup("DASHBOARD_HTTP_HOST") {
            config.http_host = val;
        }
        if let Some(val) = lookup("DASHBOARD_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http_port = port;
            }
        }
        if let Some(val) = lookup("DASHBOARD_LOG_FORMAT") {
            config.log_format = val;
        }
        if let Some(val) = lookup("DASHBOARD_HOST_KUBECONFIG") {
            config.host_kubeconfig = Some(val);
        }
        if let Some(val) = lookup("DASHBOARD_HOST_CONTEXT") {
            config.host_context = Some(val);
        }
        if let Some(val) = lookup("DASHBOARD_API_KUBECONFIG") {
            config.api_kubeconfig = Some(val);
        }
        if let Some(val) = lookup("DASHBOARD_API_CONTEXT") {
            config.api_context = Some(val);
        }
        if let Some(val) = lookup("DASHBOARD_TERMINAL_NAMESPACE") {
            config.terminal_namespace = val;
        }
        if let Some(val) = lookup("DASHBOARD_TERMINAL_IMAGE") {
            config.terminal_image = val;
        }
        if let Some(val) = lookup("DASHBOARD_TERMINAL_SERVICE_ACCOUNT") {
            config.terminal_service_account = val;
        }
        if let Some(val) = lookup("DASHBOARD_TERMINAL_IMAGE_PULL_SECRETS") {
            config.terminal_image_pull_secrets = split_list(&val);
        }
        if let Some(secs) = lookup("DASHBOARD_READINESS_TIMEOUT")
            .as_deref()
            .and_then(positive_secs)
        {
            config.readiness_timeout = secs;
        }
        if let Some(secs) = lookup("DASHBOARD_READINESS_POLL_INTERVAL")
            .as_deref()
            .and_then(positive_secs)
        {
            config.readiness_poll_interval = secs;
        }
        if let Some(secs) = lookup("DASHBOARD_ATTACH_TIMEOUT")
            .as_deref()
            .and_then(positive_secs)
        {
            config.attach_timeout = secs;
        }
        if let Some(val) = lookup("DASHBOARD_SHELLS") {
            let shells = split_list(&val);
            if !shells.is_empty() {
                config.shells = shells;
            }
        }

        config
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_interval)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            log_format: default_log_format(),
            host_kubeconfig: None,
            host_context: None,
            api_kubeconfig: None,
            api_context: None,
            terminal_namespace: default_terminal_namespace(),
            terminal_image: default_terminal_image(),
            terminal_service_account: default_terminal_service_account(),
            terminal_image_pull_secrets: Vec::new(),
            readiness_timeout: default_readiness_timeout(),
            readiness_poll_interval: default_readiness_poll_interval(),
            attach_timeout: default_attach_timeout(),
            shells: default_shells(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.readiness_timeout(), Duration::from_secs(60));
        assert_eq!(config.readiness_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.attach_timeout(), Duration::from_secs(30));
        assert_eq!(config.terminal_namespace, "karmada-system");
        assert_eq!(config.shells, vec!["bash", "sh"]);
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("DASHBOARD_HTTP_PORT", "9443"),
            ("DASHBOARD_ATTACH_TIMEOUT", "45"),
            ("DASHBOARD_TERMINAL_IMAGE_PULL_SECRETS", "regcred, ,mirror"),
            ("DASHBOARD_SHELLS", "zsh,sh"),
        ]);
        assert_eq!(config.http_port, 9443);
        assert_eq!(config.attach_timeout(), Duration::from_secs(45));
        assert_eq!(config.terminal_image_pull_secrets, vec!["regcred", "mirror"]);
        assert_eq!(config.shells, vec!["zsh", "sh"]);
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let config = load(&[
            ("DASHBOARD_READINESS_TIMEOUT", "soon"),
            ("DASHBOARD_SHELLS", " , "),
        ]);
        assert_eq!(config.readiness_timeout, 60);
        assert_eq!(config.shells, vec!["bash", "sh"]);
    }

    #[test]
    fn test_zero_durations_keep_defaults() {
        let config = load(&[
            ("DASHBOARD_READINESS_TIMEOUT", "0"),
            ("DASHBOARD_READINESS_POLL_INTERVAL", "0"),
            ("DASHBOARD_ATTACH_TIMEOUT", "0"),
        ]);
        assert_eq!(config.readiness_timeout, 60);
        assert_eq!(config.readiness_poll_interval, 5);
        assert_eq!(config.attach_timeout, 30);
        assert!(!config.readiness_poll_interval().is_zero());
    }
}
