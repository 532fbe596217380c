use std::collections::HashMap;
use std::time::Duration;

use derive_builder::Builder;

use crate::connection::RpcClientFactory;
use crate::Error;

const DEFAULT_NUM_CHANNELS: usize = 4;
const DEFAULT_SESSIONS_PER_CHANNEL: u64 = 100;
const DEFAULT_MAX_BURST: u64 = 10;
const DEFAULT_HEALTH_CHECK_WORKERS: usize = 10;
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Session pool tuning knobs.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use spanner_pool::{GrpcSessionService, RpcClientFactory, SessionPoolConfig, SessionService};
/// # async fn example() -> Result<(), spanner_pool::Error> {
/// let service = Arc::new(GrpcSessionService::connect("http://localhost:9010".into()).await?);
/// let config = SessionPoolConfig::builder()
///     .rpc_client(RpcClientFactory::from_service(service as Arc<dyn SessionService>))
///     .min_opened(25)
///     .max_opened(400)
///     .write_sessions(0.2)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(
    pattern = "owned",
    build_fn(validate = "SessionPoolConfigBuilder::check", error = "Error")
)]
pub struct SessionPoolConfig {
    /// Hard cap on open sessions. Acquires block once it is reached. `0`
    /// disables the cap; unset defaults to 100 sessions per channel.
    #[builder(setter(strip_option), default)]
    pub(crate) max_opened: Option<u64>,
    /// Floor of open sessions the pool tries to maintain. The pool stops
    /// expiring idle sessions at this count, though broken sessions are
    /// still evicted.
    #[builder(default)]
    pub(crate) min_opened: u64,
    /// Idle headroom kept above the running maximum of sessions in use.
    #[builder(default)]
    pub(crate) max_idle: u64,
    /// Cap on simultaneous in-flight creation RPCs. `0` disables the cap.
    #[builder(default = "DEFAULT_MAX_BURST")]
    pub(crate) max_burst: u64,
    /// Fraction of sessions kept pre-prepared for write, in `[0, 1]`.
    #[builder(default)]
    pub(crate) write_sessions: f64,
    /// Number of health-check workers; values below 1 are coerced to 1.
    #[builder(default = "DEFAULT_HEALTH_CHECK_WORKERS")]
    pub(crate) health_check_workers: usize,
    /// Average interval between two pings of the same session. `0` falls
    /// back to the five-minute default.
    #[builder(default = "DEFAULT_HEALTH_CHECK_INTERVAL")]
    pub(crate) health_check_interval: Duration,
    /// Cadence at which the maintainer samples pool usage. `0` falls back to
    /// the one-minute default.
    #[builder(default = "DEFAULT_SAMPLE_INTERVAL")]
    pub(crate) health_check_sample_interval: Duration,
    /// Labels stamped on every session created by the pool.
    #[builder(default)]
    pub(crate) session_labels: HashMap<String, String>,
    /// Number of gRPC channels the factory spreads sessions over; feeds only
    /// the `max_opened` default.
    #[builder(default = "DEFAULT_NUM_CHANNELS")]
    pub(crate) num_channels: usize,
    /// Transport hook handing out RPC channels.
    pub(crate) rpc_client: RpcClientFactory,
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Error::InvalidConfig(format!("missing required field `{}`", err.field_name()))
    }
}

impl SessionPoolConfig {
    pub fn builder() -> SessionPoolConfigBuilder {
        SessionPoolConfigBuilder::default()
    }

    pub(crate) fn resolved_max_opened(&self) -> u64 {
        match self.max_opened {
            Some(limit) => limit,
            None => self.num_channels as u64 * DEFAULT_SESSIONS_PER_CHANNEL,
        }
    }

    pub(crate) fn min_opened(&self) -> u64 {
        self.min_opened
    }

    pub(crate) fn max_idle(&self) -> u64 {
        self.max_idle
    }

    pub(crate) fn max_burst(&self) -> u64 {
        self.max_burst
    }

    pub(crate) fn write_sessions(&self) -> f64 {
        self.write_sessions
    }

    pub(crate) fn resolved_health_check_workers(&self) -> usize {
        self.health_check_workers.max(1)
    }

    pub(crate) fn resolved_health_check_interval(&self) -> Duration {
        if self.health_check_interval.is_zero() {
            DEFAULT_HEALTH_CHECK_INTERVAL
        } else {
            self.health_check_interval
        }
    }

    pub(crate) fn resolved_sample_interval(&self) -> Duration {
        if self.health_check_sample_interval.is_zero() {
            DEFAULT_SAMPLE_INTERVAL
        } else {
            self.health_check_sample_interval
        }
    }

    pub(crate) fn session_labels(&self) -> &HashMap<String, String> {
        &self.session_labels
    }

    pub(crate) fn rpc_client(&self) -> &RpcClientFactory {
        &self.rpc_client
    }
}

impl SessionPoolConfigBuilder {
    fn check(&self) -> Result<(), Error> {
        if self.rpc_client.is_none() {
            return Err(Error::InvalidConfig(
                "an RPC client factory is required".to_string(),
            ));
        }
        if let Some(fraction) = self.write_sessions {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(Error::InvalidConfig(format!(
                    "write_sessions must be within [0, 1], got {fraction}"
                )));
            }
        }
        let channels = self.num_channels.unwrap_or(DEFAULT_NUM_CHANNELS) as u64;
        let max_opened = match self.max_opened.flatten() {
            Some(limit) => limit,
            None => channels * DEFAULT_SESSIONS_PER_CHANNEL,
        };
        let min_opened = self.min_opened.unwrap_or(0);
        if max_opened > 0 && min_opened > max_opened {
            return Err(Error::InvalidConfig(format!(
                "min_opened ({min_opened}) must not exceed max_opened ({max_opened})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::connection::SessionService;

    fn factory() -> RpcClientFactory {
        RpcClientFactory::new(|| {
            Err(Error::InvalidConfig("not wired in this test".to_string()))
        })
    }

    #[test]
    fn test_defaults() {
        let config = SessionPoolConfig::builder()
            .rpc_client(factory())
            .build()
            .unwrap();
        assert_eq!(config.resolved_max_opened(), 400);
        assert_eq!(config.min_opened(), 0);
        assert_eq!(config.max_idle(), 0);
        assert_eq!(config.max_burst(), 10);
        assert_eq!(config.write_sessions(), 0.0);
        assert_eq!(config.resolved_health_check_workers(), 10);
        assert_eq!(
            config.resolved_health_check_interval(),
            Duration::from_secs(300)
        );
        assert_eq!(config.resolved_sample_interval(), Duration::from_secs(60));
        assert!(config.session_labels().is_empty());
    }

    #[test]
    fn test_zero_values_resolve_to_unlimited_or_defaults() {
        let config = SessionPoolConfig::builder()
            .rpc_client(factory())
            .max_opened(0)
            .max_burst(0)
            .health_check_workers(0)
            .health_check_interval(Duration::ZERO)
            .health_check_sample_interval(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.resolved_max_opened(), 0);
        assert_eq!(config.max_burst(), 0);
        assert_eq!(config.resolved_health_check_workers(), 1);
        assert_eq!(
            config.resolved_health_check_interval(),
            Duration::from_secs(300)
        );
        assert_eq!(config.resolved_sample_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_rpc_client_is_rejected() {
        let err = SessionPoolConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn test_min_opened_above_max_opened_is_rejected() {
        let err = SessionPoolConfig::builder()
            .rpc_client(factory())
            .max_opened(2)
            .min_opened(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn test_min_opened_unbounded_when_max_opened_disabled() {
        let config = SessionPoolConfig::builder()
            .rpc_client(factory())
            .max_opened(0)
            .min_opened(1_000)
            .build()
            .unwrap();
        assert_eq!(config.min_opened(), 1_000);
    }

    #[test]
    fn test_write_sessions_out_of_range_is_rejected() {
        for fraction in [-0.1, 1.1] {
            let err = SessionPoolConfig::builder()
                .rpc_client(factory())
                .write_sessions(fraction)
                .build()
                .unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{fraction}");
        }
    }

    #[test]
    fn test_factory_type_is_erased() {
        // A factory can close over any SessionService implementation.
        struct Dummy;
        #[async_trait::async_trait]
        impl SessionService for Dummy {
            async fn create_session(
                &self,
                _database: &str,
                _labels: &HashMap<String, String>,
                _md: &tonic::metadata::MetadataMap,
            ) -> Result<String, Error> {
                Ok("s".to_string())
            }
            async fn get_session(
                &self,
                _name: &str,
                _md: &tonic::metadata::MetadataMap,
            ) -> Result<(), Error> {
                Ok(())
            }
            async fn delete_session(
                &self,
                _name: &str,
                _md: &tonic::metadata::MetadataMap,
            ) -> Result<(), Error> {
                Ok(())
            }
            async fn begin_transaction(
                &self,
                _session: &str,
                _md: &tonic::metadata::MetadataMap,
            ) -> Result<Vec<u8>, Error> {
                Ok(vec![])
            }
        }
        let factory = RpcClientFactory::from_service(Arc::new(Dummy) as Arc<dyn SessionService>);
        assert!(factory.get().is_ok());
    }
}
