use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::pool::PoolConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "postgres://localhost:5432/app_database")]
    pub database_url: String,

    #[envconfig(default = "100")]
    pub max_concurrent_jobs: usize,

    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    /// Connection pool size handed to `PgmqQueue::new`.
    #[envconfig(default = "100")]
    pub max_pg_connections: u32,
}

impl Config {
    /// Produce the process-wide pool configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent_jobs_global: self.max_concurrent_jobs,
            poll_interval_when_idle: self.poll_interval.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn test_defaults_map_into_pool_config() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.max_pg_connections, 100);

        let pool_config = config.pool_config();
        assert_eq!(pool_config.max_concurrent_jobs_global, 100);
        assert_eq!(
            pool_config.poll_interval_when_idle,
            time::Duration::from_secs(1)
        );
    }

    #[test]
    fn test_poll_interval_is_parsed_as_milliseconds() {
        let mut env = HashMap::new();
        env.insert("POLL_INTERVAL".to_owned(), "250".to_owned());

        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.poll_interval.0, time::Duration::from_millis(250));
    }
}
