//! Controller configuration, read from the environment.

use crate::error::ControllerError;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Ingress class served when `INGRESS_CLASS` is unset.
pub const DEFAULT_INGRESS_CLASS: &str = "gantry";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Reconcile workers per kind
    pub workers: usize,
    /// Failed attempts after which a key is dropped; `None` retries forever
    pub max_requeues: Option<u32>,
    pub cache_sync_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Re-enqueue every cached object this often; `None` disables resync
    pub resync_period: Option<Duration>,
    pub cert_check_interval: Duration,
    /// Renewal window for certificates that do not set their own
    pub cert_renew_before_days: u32,
    /// Watch ServiceMonitors when the Prometheus operator is installed
    pub enable_service_monitors: bool,
    pub probe_addr: SocketAddr,
    pub ingress_class: String,
}

impl Config {
    /// Read the configuration from environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let workers: usize = parse(&lookup, "RECONCILE_WORKERS", 2)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_WORKERS must be at least 1".to_string(),
            ));
        }

        let max_requeues = match lookup("MAX_REQUEUES") {
            None => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|e| {
                ControllerError::InvalidConfig(format!("MAX_REQUEUES={raw}: {e}"))
            })?),
        };

        let cert_check_interval = seconds(&lookup, "CERT_CHECK_INTERVAL_SECS", 300)?;
        if cert_check_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "CERT_CHECK_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            namespace,
            workers,
            max_requeues,
            cache_sync_timeout: seconds(&lookup, "CACHE_SYNC_TIMEOUT_SECS", 120)?,
            shutdown_grace: seconds(&lookup, "SHUTDOWN_GRACE_SECS", 30)?,
            resync_period: Some(seconds(&lookup, "RESYNC_PERIOD_SECS", 0)?).filter(|p| !p.is_zero()),
            cert_check_interval,
            cert_renew_before_days: parse(&lookup, "CERT_RENEW_BEFORE_DAYS", 15)?,
            enable_service_monitors: flag(&lookup, "ENABLE_SERVICE_MONITORS", true)?,
            probe_addr: parse(&lookup, "PROBE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            ingress_class: lookup("INGRESS_CLASS")
                .filter(|class| !class.is_empty())
                .unwrap_or_else(|| DEFAULT_INGRESS_CLASS.to_string()),
        })
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "  Namespace: {}",
            self.namespace.as_deref().unwrap_or("all namespaces")
        );
        info!("  Ingress class: {}", self.ingress_class);
        info!("  Reconcile workers: {}", self.workers);
        match self.max_requeues {
            Some(max) => info!("  Max requeues: {}", max),
            None => info!("  Max requeues: unlimited"),
        }
        info!("  Cache sync timeout: {:?}", self.cache_sync_timeout);
        info!("  Shutdown grace: {:?}", self.shutdown_grace);
        match self.resync_period {
            Some(period) => info!("  Resync period: {:?}", period),
            None => info!("  Resync period: disabled"),
        }
        info!("  Certificate check interval: {:?}", self.cert_check_interval);
        info!("  Certificate renewal window: {} days", self.cert_renew_before_days);
        info!("  ServiceMonitors: {}", self.enable_service_monitors);
        info!("  Probe address: {}", self.probe_addr);
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ControllerError> {
    parse(lookup, key, default).map(Duration::from_secs)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, ControllerError> {
    match lookup(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ControllerError::InvalidConfig(format!(
            "{key}={other}: expected true or false"
        ))),
    }
}
