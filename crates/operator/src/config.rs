use clap::Parser;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::cluster::ClusterConfig;
use crate::kubernetes::service_account_namespace;
use crate::store::{AlertStoreConfig, StoreBackend};
use crate::{Error, Result};


/// Command line flags. Every flag can also be set through its environment
/// variable.
#[derive(Debug, Clone, Parser)]
#[clap(name = "openfero", version, about = "Alert-triggered remediation job dispatcher")]
pub struct Cli {
    /// Address to listen on for webhooks.
    #[clap(long, env = "ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    /// Namespace holding job templates. Defaults to the current namespace.
    #[clap(long, env = "CONFIGMAP_NAMESPACE")]
    pub configmap_namespace: Option<String>,
    /// Namespace jobs are created in. Defaults to the current namespace.
    #[clap(long, env = "JOB_DESTINATION_NAMESPACE")]
    pub job_destination_namespace: Option<String>,
    /// `key=value[,key=value]` labels selecting templates and jobs.
    #[clap(long, env = "LABEL_SELECTOR", default_value = "app=openfero")]
    pub label_selector: String,
    #[clap(long, env = "JOB_TTL_SECONDS", default_value = "300")]
    pub job_ttl_seconds: i32,
    #[clap(long, env = "SUBMIT_TIMEOUT_SECONDS", default_value = "30")]
    pub submit_timeout_seconds: u64,
    #[clap(long, env = "SYNC_TIMEOUT_SECONDS", default_value = "60")]
    pub sync_timeout_seconds: u64,
    /// `memory` or `memberlist`.
    #[clap(long, env = "ALERT_STORE_TYPE", default_value = "memory")]
    pub alert_store_type: StoreBackend,
    #[clap(long, env = "ALERT_STORE_SIZE", default_value = "10")]
    pub alert_store_size: usize,
    #[clap(long, env = "ALERT_STORE_CLUSTER_NAME", default_value = "openfero")]
    pub cluster_name: String,
    #[clap(long, env = "MEMBERLIST_PORT", default_value = "7946")]
    pub memberlist_port: u16,
    /// Headless service resolving to all peer instances.
    #[clap(long, env = "MEMBERLIST_SERVICE_NAME", default_value = "openfero-headless")]
    pub memberlist_service_name: String,
    /// Explicit `host[:port]` seeds; replaces the headless service lookup.
    #[clap(long, env = "MEMBERLIST_SEEDS", value_delimiter = ',')]
    pub memberlist_seeds: Vec<String>,
    #[clap(long, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,
    /// Address announced to peers.
    #[clap(long, env = "POD_IP")]
    pub pod_ip: Option<IpAddr>,
    #[clap(long, env = "GOSSIP_INTERVAL_MS", default_value = "200")]
    pub gossip_interval_ms: u64,
    #[clap(long, env = "PUSH_PULL_INTERVAL_SECONDS", default_value = "30")]
    pub push_pull_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub log_level: String,
    pub kube: KubeConfig,
    pub alert_store: AlertStoreConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub configmap_namespace: Option<String>,
    pub job_destination_namespace: Option<String>,
    pub label_selector: BTreeMap<String, String>,
    pub job_ttl_seconds: i32,
    pub submit_timeout: Duration,
    pub sync_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log_level: "info".to_string(),
            kube: KubeConfig::default(),
            alert_store: AlertStoreConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            configmap_namespace: None,
            job_destination_namespace: None,
            label_selector: BTreeMap::from([("app".to_string(), "openfero".to_string())]),
            job_ttl_seconds: 300,
            submit_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

impl KubeConfig {
    /// Label selector in the `k=v,k=v` form the API server accepts.
    pub fn selector_string(&self) -> String {
        self.label_selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let label_selector = parse_label_selector(&cli.label_selector)?;
        if cli.job_ttl_seconds < 0 {
            return Err(Error::Config("job TTL must not be negative".to_string()));
        }

        let namespace = cli
            .pod_namespace
            .clone()
            .or_else(service_account_namespace)
            .unwrap_or_else(|| "default".to_string());
        let seeds = if cli.memberlist_seeds.is_empty() {
            vec![format!(
                "{}.{}.svc.cluster.local:{}",
                cli.memberlist_service_name, namespace, cli.memberlist_port
            )]
        } else {
            cli.memberlist_seeds
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let cluster = ClusterConfig {
            cluster_name: cli.cluster_name,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.memberlist_port)),
            advertise_addr: cli.pod_ip.map(|ip| SocketAddr::new(ip, cli.memberlist_port)),
            seeds,
            gossip_interval: Duration::from_millis(cli.gossip_interval_ms),
            push_pull_interval: Duration::from_secs(cli.push_pull_interval_seconds),
            ..ClusterConfig::default()
        };

        let alert_store = AlertStoreConfig {
            backend: cli.alert_store_type,
            size: cli.alert_store_size,
            cluster,
        };
        alert_store.validate().map_err(Error::Config)?;

        Ok(Self {
            server: ServerConfig { addr: cli.addr },
            log_level: cli.log_level,
            kube: KubeConfig {
                configmap_namespace: cli.configmap_namespace.filter(|ns| !ns.is_empty()),
                job_destination_namespace: cli
                    .job_destination_namespace
                    .filter(|ns| !ns.is_empty()),
                label_selector,
                job_ttl_seconds: cli.job_ttl_seconds,
                submit_timeout: Duration::from_secs(cli.submit_timeout_seconds),
                sync_timeout: Duration::from_secs(cli.sync_timeout_seconds),
            },
            alert_store,
        })
    }
}

/// Parse `key=value[,key=value]` into a label map.
pub fn parse_label_selector(selector: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(Error::Config(format!(
                    "invalid label selector entry {:?}, expected key=value",
                    pair
                )))
            }
        }
    }
    if labels.is_empty() {
        return Err(Error::Config("label selector must not be empty".to_string()));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["openfero"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_label_selector() {
        let labels = parse_label_selector("app=openfero, team = sre").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["app"], "openfero");
        assert_eq!(labels["team"], "sre");

        assert!(parse_label_selector("").is_err());
        assert!(parse_label_selector("app").is_err());
        assert!(parse_label_selector("=openfero").is_err());
    }

    #[test]
    fn test_selector_string() {
        let kube = KubeConfig {
            label_selector: parse_label_selector("b=2,a=1").unwrap(),
            ..Default::default()
        };
        assert_eq!(kube.selector_string(), "a=1,b=2");
    }

    #[test]
    fn test_memberlist_flags() {
        let config = Config::from_cli(cli(&[
            "--alert-store-type",
            "memberlist",
            "--alert-store-size",
            "50",
            "--pod-namespace",
            "monitoring",
            "--pod-ip",
            "10.0.0.7",
            "--memberlist-port",
            "7000",
        ]))
        .unwrap();

        assert_eq!(config.alert_store.backend, StoreBackend::Memberlist);
        assert_eq!(config.alert_store.size, 50);
        let cluster = &config.alert_store.cluster;
        assert_eq!(
            cluster.seeds,
            vec!["openfero-headless.monitoring.svc.cluster.local:7000".to_string()]
        );
        assert_eq!(cluster.bind_addr.port(), 7000);
        assert_eq!(cluster.advertise_addr, Some("10.0.0.7:7000".parse().unwrap()));
    }

    #[test]
    fn test_default_seed_uses_mounted_namespace() {
        let config = Config::from_cli(cli(&[])).unwrap();
        let namespace = service_account_namespace().unwrap_or_else(|| "default".to_string());
        assert_eq!(
            config.alert_store.cluster.seeds,
            vec![format!("openfero-headless.{}.svc.cluster.local:7946", namespace)]
        );
    }

    #[test]
    fn test_explicit_seeds() {
        let config = Config::from_cli(cli(&["--memberlist-seeds", "a:7946, b"])).unwrap();
        assert_eq!(config.alert_store.cluster.seeds, vec!["a:7946", "b"]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_cli(cli(&["--alert-store-size", "0"])).is_err());
        assert!(Config::from_cli(cli(&["--label-selector", "oops"])).is_err());
        assert!(Cli::try_parse_from(["openfero", "--alert-store-type", "redis"]).is_err());
    }
}
