use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rayd",
    about = "Inbound manager for an Xray relay engine",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Supervise the engine and keep it in sync with the stored state (default).
    Run,

    /// Print the engine configuration compiled from the stored state.
    Compile,

    /// Generate a Reality x25519 keypair, or derive the public key of --private-key.
    X25519(X25519Args),

    /// Print the share link of a client.
    Link(LinkArgs),
}

#[derive(Args, Debug, Clone)]
pub struct X25519Args {
    #[arg(long, value_name = "KEY")]
    pub private_key: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    #[arg(value_name = "CLIENT_ID")]
    pub client_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "RAYD_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        global = true,
        env = "RAYD_ENGINE_BIN",
        value_name = "PATH",
        default_value = "xray"
    )]
    pub engine_bin: PathBuf,

    /// Where the compiled engine configuration is written. Defaults to <data-dir>/xray.json.
    #[arg(long, global = true, env = "RAYD_ENGINE_CONFIG", value_name = "PATH")]
    pub engine_config: Option<PathBuf>,

    /// Engine stats API address. Defaults to 127.0.0.1 on the stored api port.
    #[arg(long, global = true, env = "RAYD_STATS_API_ADDR", value_name = "ADDR")]
    pub stats_api_addr: Option<SocketAddr>,

    /// Host clients connect to; used in share links.
    #[arg(
        long,
        global = true,
        env = "RAYD_PUBLIC_HOST",
        value_name = "HOST",
        default_value = ""
    )]
    pub public_host: String,

    #[arg(
        long = "stats-interval-secs",
        global = true,
        env = "RAYD_STATS_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub stats_interval_secs: u64,

    #[arg(
        long = "quota-tick-secs",
        global = true,
        env = "RAYD_QUOTA_TICK_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub quota_tick_secs: u64,

    #[arg(
        long = "readiness-timeout-secs",
        global = true,
        env = "RAYD_READINESS_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub readiness_timeout_secs: u64,

    #[arg(
        long = "max-restarts",
        global = true,
        env = "RAYD_MAX_RESTARTS",
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..=100)
    )]
    pub max_restarts: u32,

    #[arg(
        long = "restart-backoff-base-ms",
        global = true,
        env = "RAYD_RESTART_BACKOFF_BASE_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub restart_backoff_base_ms: u64,

    #[arg(
        long = "restart-backoff-cap-secs",
        global = true,
        env = "RAYD_RESTART_BACKOFF_CAP_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub restart_backoff_cap_secs: u64,

    /// Uptime after which a running engine's restart counter is cleared.
    #[arg(
        long = "stable-after-secs",
        global = true,
        env = "RAYD_STABLE_AFTER_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub stable_after_secs: u64,

    /// Apply shape-preserving changes with SIGHUP instead of a restart. Stock xray exits on
    /// SIGHUP; only enable this behind a wrapper that reloads on it.
    #[arg(
        long = "engine-reload-signal",
        global = true,
        env = "RAYD_ENGINE_RELOAD_SIGNAL",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub engine_reload_signal: bool,

    #[arg(
        long = "engine-ready-marker",
        global = true,
        env = "RAYD_ENGINE_READY_MARKER",
        value_name = "TEXT",
        default_value = "started"
    )]
    pub engine_ready_marker: String,

    #[arg(
        long = "reconcile-debounce-ms",
        global = true,
        env = "RAYD_RECONCILE_DEBOUNCE_MS",
        value_name = "MS",
        default_value_t = 200,
        value_parser = clap::value_parser!(u64).range(0..=10_000)
    )]
    pub reconcile_debounce_ms: u64,
}

impl Config {
    pub fn engine_config_path(&self) -> PathBuf {
        self.engine_config
            .clone()
            .unwrap_or_else(|| self.data_dir.join("xray.json"))
    }

    pub fn stats_api_addr_for(&self, api_port: u16) -> SocketAddr {
        self.stats_api_addr
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, api_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["rayd"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.data_dir, PathBuf::from("./data"));
        assert_eq!(cli.config.engine_bin, PathBuf::from("xray"));
        assert_eq!(
            cli.config.engine_config_path(),
            PathBuf::from("./data/xray.json")
        );
        assert_eq!(
            cli.config.stats_api_addr_for(10085),
            "127.0.0.1:10085".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(cli.config.stats_interval_secs, 10);
        assert_eq!(cli.config.quota_tick_secs, 30);
        assert_eq!(cli.config.readiness_timeout_secs, 10);
        assert_eq!(cli.config.max_restarts, 5);
        assert_eq!(cli.config.restart_backoff_base_ms, 500);
        assert_eq!(cli.config.restart_backoff_cap_secs, 30);
        assert_eq!(cli.config.stable_after_secs, 60);
        assert!(!cli.config.engine_reload_signal);
        assert_eq!(cli.config.engine_ready_marker, "started");
        assert_eq!(cli.config.reconcile_debounce_ms, 200);
    }

    #[test]
    fn explicit_paths_override_derived_ones() {
        let cli = Cli::try_parse_from([
            "rayd",
            "--engine-config",
            "/etc/xray/config.json",
            "--stats-api-addr",
            "127.0.0.1:9999",
            "compile",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Compile)));
        assert_eq!(
            cli.config.engine_config_path(),
            PathBuf::from("/etc/xray/config.json")
        );
        assert_eq!(cli.config.stats_api_addr_for(10085).port(), 9999);
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["rayd", "link", "01JG8ZQ4W3", "--public-host", "a.example"])
            .unwrap();
        let Some(Command::Link(args)) = cli.command else {
            panic!("expected link command");
        };
        assert_eq!(args.client_id, "01JG8ZQ4W3");
        assert_eq!(cli.config.public_host, "a.example");
    }

    #[test]
    fn rejects_invalid_stats_interval_secs() {
        let err = Cli::try_parse_from(["rayd", "--stats-interval-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--stats-interval-secs"));
        assert!(msg.contains("1..=300"));
    }

    #[test]
    fn rejects_invalid_max_restarts() {
        let err = Cli::try_parse_from(["rayd", "--max-restarts", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--max-restarts"));
        assert!(msg.contains("1..=100"));
    }

    #[test]
    fn rejects_invalid_restart_backoff_base_ms() {
        let err = Cli::try_parse_from(["rayd", "--restart-backoff-base-ms", "5"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--restart-backoff-base-ms"));
        assert!(msg.contains("10..=60000"));
    }

    #[test]
    fn parses_engine_reload_signal_as_bool_value() {
        let cli = Cli::try_parse_from(["rayd", "--engine-reload-signal", "true"]).unwrap();
        assert!(cli.config.engine_reload_signal);
    }
}
