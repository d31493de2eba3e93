use std::path::PathBuf;

use clap::Parser;

const DEFAULT_CIPHERS: &str = "ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-SHA384:\
ECDHE-RSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA256:ECDHE-RSA-AES256-SHA:DHE-RSA-AES256-SHA";

/// websocket to redis pub/sub gateway
#[derive(Debug, Parser)]
#[command(name = "wsgate", version, about)]
pub struct Args {
    /// listen address
    #[arg(long = "bind_host", default_value = "0.0.0.0")]
    pub bind_host: String,
    /// listen port
    #[arg(long = "bind_port", default_value_t = 9999)]
    pub bind_port: u16,
    /// redis address
    #[arg(long = "redis_host", default_value = "127.0.0.1")]
    pub redis_host: String,
    /// redis port
    #[arg(long = "redis_port", default_value_t = 6379)]
    pub redis_port: u16,
    /// log file path
    #[arg(long = "log", default_value = "/dev/stderr")]
    pub log: PathBuf,
    /// serve tls
    #[arg(long = "use_ssl")]
    pub use_ssl: bool,
    /// pem certificate chain, required with --use_ssl
    #[arg(long = "ssl_certificate_chain")]
    pub ssl_certificate_chain: Option<PathBuf>,
    /// pem private key, required with --use_ssl
    #[arg(long = "ssl_private_key")]
    pub ssl_private_key: Option<PathBuf>,
    /// pem dh parameters; accepted for compatibility, rustls negotiates
    /// ECDHE on its own
    #[arg(long = "ssl_dh_params")]
    pub ssl_dh_params: Option<PathBuf>,
    /// openssl cipher list; accepted for compatibility, rustls picks from
    /// its built-in suites
    #[arg(long = "ssl_ciphers", default_value = DEFAULT_CIPHERS)]
    pub ssl_ciphers: String,
}
