//! Runtime configuration
//!
//! Command-line flags (with environment fallbacks) are parsed into
//! [`RunArgs`] and validated into a [`Config`] before anything connects.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::error::Error;
use crate::resolver::NodeSelector;
use crate::retry::RetryConfig;

/// Flags for the `run` command
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Kubeconfig file, or a list joined by the platform path separator
    ///
    /// When omitted the client is inferred: `KUBECONFIG`, then
    /// $HOME/.kube/config, then the in-cluster service account.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Base URL of the registrar
    #[arg(long, env = "REGISTRAR_URL", default_value = crate::DEFAULT_REGISTRAR_URL)]
    pub registrar_url: String,

    /// Only watch Services in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Node selection policy: worker, label:<key>[=<value>] or index:<n>
    #[arg(long, default_value = "worker")]
    pub node_selector: NodeSelector,

    /// Node annotation holding the public listener IP
    #[arg(long, default_value = crate::PUBLIC_IP_ANNOTATION)]
    pub address_annotation: String,

    /// Number of event handling workers
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Per-worker queue depth
    #[arg(long, default_value_t = 64)]
    pub queue_depth: usize,

    /// Registrar request timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub registrar_timeout_secs: u64,

    /// Maximum attempts per outbound call (0 = retry forever)
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Address for the health server
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Seconds to wait for queued events on shutdown
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Consecutive failures before /readyz reports unavailable
    #[arg(long, default_value_t = crate::DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit kubeconfig path
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context override
    pub context: Option<String>,
    /// Registrar base URL, without a trailing slash
    pub registrar_url: String,
    /// Namespace scope; `None` = all namespaces
    pub namespace: Option<String>,
    /// Node selection policy
    pub node_selector: NodeSelector,
    /// Annotation key for the listener IP
    pub address_annotation: String,
    /// Worker count
    pub workers: usize,
    /// Per-worker queue depth
    pub queue_depth: usize,
    /// Registrar request timeout
    pub registrar_timeout: Duration,
    /// Kubernetes connect timeout
    pub kube_connect_timeout: Duration,
    /// Kubernetes read timeout
    pub kube_read_timeout: Duration,
    /// Backoff for outbound calls
    pub retry: RetryConfig,
    /// Health server address
    pub health_addr: SocketAddr,
    /// Readiness failure threshold
    pub failure_threshold: u64,
    /// Time allowed to drain queued events on shutdown
    pub shutdown_grace: Duration,
}

impl TryFrom<RunArgs> for Config {
    type Error = Error;

    fn try_from(args: RunArgs) -> Result<Self, Self::Error> {
        let config = Config {
            kubeconfig: args.kubeconfig,
            context: args.context,
            registrar_url: args.registrar_url.trim_end_matches('/').to_string(),
            namespace: args.namespace.filter(|ns| !ns.is_empty()),
            node_selector: args.node_selector,
            address_annotation: args.address_annotation,
            workers: args.workers,
            queue_depth: args.queue_depth,
            registrar_timeout: Duration::from_secs(args.registrar_timeout_secs),
            kube_connect_timeout: Duration::from_secs(10),
            kube_read_timeout: Duration::from_secs(30),
            retry: RetryConfig::with_max_attempts(args.max_attempts),
            health_addr: args.health_addr,
            failure_threshold: args.failure_threshold,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Check values that clap cannot
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.registrar_url.starts_with("http://") || self.registrar_url.starts_with("https://"))
        {
            return Err(Error::config(format!(
                "registrar URL must be http(s): {}",
                self.registrar_url
            )));
        }
        if self.address_annotation.trim().is_empty() {
            return Err(Error::config("address annotation must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(Error::config("queue depth must be at least 1"));
        }
        if self.registrar_timeout.is_zero() {
            return Err(Error::config("registrar timeout must be non-zero"));
        }
        if self.failure_threshold == 0 {
            return Err(Error::config("failure threshold must be at least 1"));
        }
        if self.kube_read_timeout.as_secs()
            <= u64::from(crate::event::WATCH_TIMEOUT_SECS)
        {
            return Err(Error::config(
                "kubernetes read timeout must exceed the watch timeout",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> Result<Config, Error> {
        let mut argv = vec!["nodeport-registrar"];
        argv.extend_from_slice(args);
        let cli = TestCli::try_parse_from(argv).map_err(|e| Error::config(e.to_string()))?;
        Config::try_from(cli.run)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&["--registrar-url", "http://127.0.0.1:5000"]).unwrap();
        assert_eq!(config.registrar_url, "http://127.0.0.1:5000");
        assert_eq!(config.node_selector, NodeSelector::Worker);
        assert_eq!(config.address_annotation, crate::PUBLIC_IP_ANNOTATION);
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.registrar_timeout, Duration::from_secs(10));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = parse(&["--registrar-url", "http://reg:5000/"]).unwrap();
        assert_eq!(config.registrar_url, "http://reg:5000");
    }

    #[test]
    fn node_selector_flag_is_parsed() {
        let config = parse(&[
            "--registrar-url",
            "http://reg",
            "--node-selector",
            "index:1",
        ])
        .unwrap();
        assert_eq!(config.node_selector, NodeSelector::Index(1));

        assert!(parse(&["--registrar-url", "http://reg", "--node-selector", "first"]).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--registrar-url", "reg:5000"]).is_err());
        assert!(parse(&["--registrar-url", "http://reg", "--workers", "0"]).is_err());
        assert!(parse(&["--registrar-url", "http://reg", "--queue-depth", "0"]).is_err());
        assert!(parse(&["--registrar-url", "http://reg", "--failure-threshold", "0"]).is_err());
        assert!(parse(&[
            "--registrar-url",
            "http://reg",
            "--registrar-timeout-secs",
            "0"
        ])
        .is_err());
        assert!(parse(&["--registrar-url", "http://reg", "--address-annotation", " "]).is_err());
    }

    #[test]
    fn kubeconfig_is_not_read_from_environment() {
        std::env::set_var("KUBECONFIG", "/tmp/a-kubeconfig:/tmp/b-kubeconfig");
        let config = parse(&["--registrar-url", "http://reg"]).unwrap();
        assert_eq!(config.kubeconfig, None);

        let config = parse(&["--registrar-url", "http://reg", "--kubeconfig", "/etc/kc"]).unwrap();
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/etc/kc")));
    }

    #[test]
    fn shutdown_grace_defaults_to_thirty_seconds() {
        let config = parse(&["--registrar-url", "http://reg"]).unwrap();
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn empty_namespace_means_all() {
        let config = parse(&["--registrar-url", "http://reg", "--namespace", ""]).unwrap();
        assert_eq!(config.namespace, None);
    }
}
