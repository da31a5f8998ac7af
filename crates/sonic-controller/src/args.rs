use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Args {
    /// Controller config file (YAML).
    #[arg(long, env = "SONIC_CONFIG", default_value = "/etc/sonic/controller.yaml")]
    pub config: PathBuf,

    /// Metadata store: an etcd endpoint, or "memory" for a process-local store.
    #[arg(long, env = "SONIC_STORE", default_value = "http://127.0.0.1:2379")]
    pub store: String,

    #[arg(long, env = "SONIC_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    pub listen_addr: String,

    /// Overrides the namespace from the config file.
    #[arg(long, env = "SONIC_NAMESPACE")]
    pub namespace: Option<String>,

    /// OTLP/HTTP collector base URL for span export.
    #[arg(long, env = "OTLP_URL")]
    pub otlp_url: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// "text" or "json".
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}
