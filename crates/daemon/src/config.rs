//! Command line and environment configuration for `vigild`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use vigil_server::ServerConfig;
use vigil_session::{RoundSchedule, ScheduleError};
use vigil_store::SessionStore;

#[derive(Parser, Debug, Clone)]
#[command(name = "vigild", version, about = "Vigil contest session daemon")]
pub struct Args {
    /// Address to accept WebSocket connections on
    #[arg(long, env = "VIGIL_LISTEN", default_value = "0.0.0.0:3001")]
    pub listen: SocketAddr,

    /// Directory holding the session database
    #[arg(long, env = "VIGIL_DATA_DIR", default_value = "vigil-data")]
    pub data_dir: PathBuf,

    /// Shared secret for the admin slot; empty disables admin login
    #[arg(long, env = "VIGIL_ADMIN_SECRET", default_value = "", hide_env_values = true)]
    pub admin_secret: String,

    /// Per-round durations in minutes, comma separated (e.g. 30,45,60)
    #[arg(long, env = "VIGIL_ROUND_MINUTES", value_delimiter = ',')]
    pub round_minutes: Option<Vec<i64>>,

    /// Seconds without a heartbeat before a candidate shows as offline
    #[arg(long, env = "VIGIL_GRACE_SECS", default_value_t = 15)]
    pub grace_secs: u64,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid round schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("grace window must be at least one second")]
    ZeroGrace,
}

/// Validated daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub admin_secret: String,
    /// Set only when given on the command line.
    pub round_schedule: Option<RoundSchedule>,
    pub heartbeat_grace_ms: u64,
}

impl Args {
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let round_schedule = self
            .round_minutes
            .as_deref()
            .map(RoundSchedule::from_minutes)
            .transpose()?;
        if self.grace_secs == 0 {
            return Err(ConfigError::ZeroGrace);
        }
        Ok(Settings {
            listen: self.listen,
            data_dir: self.data_dir.clone(),
            admin_secret: self.admin_secret.clone(),
            round_schedule,
            heartbeat_grace_ms: self.grace_secs.saturating_mul(1000),
        })
    }
}

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            schedule: self.round_schedule.clone().unwrap_or_default(),
            heartbeat_grace_ms: self.heartbeat_grace_ms,
            ..Default::default()
        }
    }

    /// Persist command-line round durations so they replace any earlier
    /// overrides, including across restarts.
    pub fn apply_overrides(&self, store: &mut SessionStore) {
        let Some(schedule) = &self.round_schedule else {
            return;
        };
        let mut config = store.config().clone();
        config.round_overrides_secs = (1..=schedule.max_round())
            .map(|round| (round, schedule.duration_secs(round)))
            .collect();
        store.set_config(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("vigild").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&[]).settings().unwrap();
        assert_eq!(settings.listen.port(), 3001);
        assert!(settings.round_schedule.is_none());
        assert_eq!(settings.heartbeat_grace_ms, 15_000);
        assert_eq!(settings.server_config().schedule.duration_secs(3), 3600);
    }

    #[test]
    fn test_round_minutes() {
        let settings = parse(&["--round-minutes", "10,20"]).settings().unwrap();
        let schedule = settings.round_schedule.as_ref().unwrap();
        assert_eq!(schedule.max_round(), 2);
        assert_eq!(schedule.duration_secs(2), 1200);
    }

    /// Zero-length rounds are a startup error.
    #[test]
    fn test_non_positive_round_rejected() {
        let err = parse(&["--round-minutes", "30,0,60"]).settings().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Schedule(ScheduleError::NonPositive { round: 2, .. })
        ));
    }

    #[test]
    fn test_overrides_persisted() {
        let settings = parse(&["--round-minutes", "5,6,7"]).settings().unwrap();
        let mut store = SessionStore::in_memory();
        settings.apply_overrides(&mut store);
        assert_eq!(store.config().round_overrides_secs.get(&2), Some(&360));

        let untouched = parse(&[]).settings().unwrap();
        untouched.apply_overrides(&mut store);
        assert_eq!(store.config().round_overrides_secs.len(), 3);
    }
}
