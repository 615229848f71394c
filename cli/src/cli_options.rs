use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Start the serving HTTP API on a given port
    Serve {
        /// Specify a host for the server
        #[arg(short = 'n', long = "host", default_value = "127.0.0.1")]
        host: String,
        /// Specify a port for the server
        #[arg(short = 'p', long = "port", default_value_t = 6566)]
        port: u16,
        /// path to TLS certificate private key. You need to pass --cert as well to start server in TLS mode
        #[arg(short='k', long="key", default_value = None)]
        key: Option<String>,
        /// path to TLS certificate public key. You need to pass --key as well to start server in TLS mode
        #[arg(short='c', long="cert", default_value = None)]
        cert: Option<String>,
        /// Enable the Prometheus /metrics endpoint
        #[arg(short = 'm', long = "metrics", default_value_t = false)]
        metrics_enabled: bool,
    },
    /// Load the serving configuration and feature sets, then exit
    Validate,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliOptions {
    /// Directory relative paths in the serving configuration are resolved against.
    #[arg(short = 'c', long = "chdir", env = "FEAST_SERVING_DIR", default_value = None)]
    pub chdir: Option<String>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Path of the serving configuration, relative to --chdir.
    #[arg(
        short = 'f',
        long = "serving-yaml",
        env = "FEAST_SERVING_YAML",
        default_value = "serving.yaml"
    )]
    pub serving_yaml: String,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_command() {
        let options = CliOptions::parse_from([
            "feast-serving",
            "--log-level",
            "DEBUG",
            "-f",
            "conf/serving.yaml",
            "serve",
            "--port",
            "8080",
            "--metrics",
        ]);
        assert_eq!(options.log_level, LogLevel::Debug);
        assert_eq!(options.serving_yaml, "conf/serving.yaml");
        match options.command {
            CliCommand::Serve {
                host,
                port,
                key,
                metrics_enabled,
                ..
            } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8080);
                assert!(key.is_none());
                assert!(metrics_enabled);
            }
            CliCommand::Validate => panic!("expected serve"),
        }
    }
}
