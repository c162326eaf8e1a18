use clap::{Parser, ValueEnum};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

/// Command line flags, each overriding the matching setting when given
#[derive(Parser, Debug, Default)]
#[command(version, about = "Provisions MongoDB and PostgreSQL databases and users")]
pub struct Args {
    /// Address the metrics endpoint binds to
    #[arg(long)]
    pub metrics_addr: Option<String>,
    /// Address the health and diagnostics endpoints bind to
    #[arg(long)]
    pub health_addr: Option<String>,
    /// Maximum concurrent reconciles per record kind
    #[arg(long)]
    pub concurrent: Option<u16>,
    /// Time in-flight reconciles get to finish on shutdown, e.g. `10m`
    #[arg(long)]
    pub graceful_shutdown_timeout: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub watch_all_namespaces: Option<bool>,
    /// Only reconcile records matching this label selector
    #[arg(long)]
    pub watch_label_selector: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub enable_leader_election: Option<bool>,
    #[arg(long)]
    pub leader_election_namespace: Option<String>,
    #[arg(long)]
    pub leader_election_id: Option<String>,
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
    /// Base URL of the Atlas admin API
    #[arg(long)]
    pub atlas_url: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub postgres_accept_invalid_certs: Option<bool>,
    /// Namespace watched unless all namespaces are
    #[arg(long, env = "RUNTIME_NAMESPACE")]
    pub runtime_namespace: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    pub metrics_addr: String,
    pub health_addr: String,
    pub concurrent: u16,
    pub graceful_shutdown_timeout: String,
    pub watch_all_namespaces: bool,
    pub watch_label_selector: Option<String>,
    pub enable_leader_election: bool,
    pub leader_election_namespace: Option<String>,
    pub leader_election_id: String,
    pub log_format: LogFormat,
    pub atlas_url: String,
    pub postgres_accept_invalid_certs: bool,
    pub runtime_namespace: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            metrics_addr: "0.0.0.0:9556".into(),
            health_addr: "0.0.0.0:9557".into(),
            concurrent: 4,
            graceful_shutdown_timeout: "600s".into(),
            watch_all_namespaces: false,
            watch_label_selector: None,
            enable_leader_election: false,
            leader_election_namespace: None,
            leader_election_id: "db-controller-leader-election".into(),
            log_format: LogFormat::Compact,
            atlas_url: crate::adapter::atlas::DEFAULT_URL.into(),
            postgres_accept_invalid_certs: false,
            runtime_namespace: None,
        }
    }
}

impl Settings {
    /// Defaults, then settings files, then `DBCONTROLLER__*` variables, then flags.
    pub fn new(args: &Args) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("settings").required(false))
            .add_source(File::with_name("/etc/db-controller/settings").required(false))
            .add_source(
                Environment::with_prefix("DBCONTROLLER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("metrics_addr", args.metrics_addr.clone())?
            .set_override_option("health_addr", args.health_addr.clone())?
            .set_override_option("concurrent", args.concurrent.map(u64::from))?
            .set_override_option(
                "graceful_shutdown_timeout",
                args.graceful_shutdown_timeout.clone(),
            )?
            .set_override_option("watch_all_namespaces", args.watch_all_namespaces)?
            .set_override_option("watch_label_selector", args.watch_label_selector.clone())?
            .set_override_option("enable_leader_election", args.enable_leader_election)?
            .set_override_option(
                "leader_election_namespace",
                args.leader_election_namespace.clone(),
            )?
            .set_override_option("leader_election_id", args.leader_election_id.clone())?
            .set_override_option("log_format", args.log_format.map(|f| f.as_str()))?
            .set_override_option("atlas_url", args.atlas_url.clone())?
            .set_override_option(
                "postgres_accept_invalid_certs",
                args.postgres_accept_invalid_certs,
            )?
            .set_override_option("runtime_namespace", args.runtime_namespace.clone())?
            .build()?;

        settings.try_deserialize()
    }

    pub fn graceful_shutdown_timeout(&self) -> crate::Result<std::time::Duration> {
        crate::reconcile::parse_duration(&self.graceful_shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_without_sources() {
        let settings = Settings::new(&Args::default()).unwrap();
        assert_eq!(settings.metrics_addr, "0.0.0.0:9556");
        assert_eq!(settings.concurrent, 4);
        assert_eq!(settings.log_format, LogFormat::Compact);
        assert_eq!(
            settings.graceful_shutdown_timeout().unwrap(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "db-controller",
            "--concurrent",
            "8",
            "--watch-all-namespaces",
            "--log-format",
            "json",
            "--graceful-shutdown-timeout",
            "1m",
            "--watch-label-selector",
            "team=a",
        ]);
        let settings = Settings::new(&args).unwrap();

        assert_eq!(settings.concurrent, 8);
        assert!(settings.watch_all_namespaces);
        assert!(!settings.enable_leader_election);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.watch_label_selector.as_deref(), Some("team=a"));
        assert_eq!(
            settings.graceful_shutdown_timeout().unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn boolean_flags_accept_explicit_values() {
        let args = Args::parse_from(["db-controller", "--enable-leader-election=false"]);
        assert_eq!(args.enable_leader_election, Some(false));
    }
}
