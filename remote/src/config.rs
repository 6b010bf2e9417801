use std::time::Duration;

use clap::builder::PossibleValuesParser;
use url::Url;

use crate::Error;

/// Everything needed to connect to a remote execution service.
#[derive(clap::Args, Clone, Debug)]
pub struct RemoteExecutionConfig {
    /// The instance name passed along with every request. May be empty.
    #[arg(long, env = "REXEC_INSTANCE_NAME", default_value = "")]
    pub instance_name: String,

    /// Deadline of every CAS call, and the longest the execution engine may
    /// stay silent during an execution.
    #[arg(long, env = "REXEC_CAS_DEADLINE_SECS", default_value_t = 60)]
    pub cas_deadline_secs: u64,

    /// Number of independent connections to the execution engine, calls
    /// are spread over them round-robin.
    #[arg(long, env = "REXEC_ENGINE_CONNECTIONS", default_value_t = 1)]
    pub engine_connections: usize,

    /// How many output files are downloaded at the same time.
    #[arg(long, env = "REXEC_OUTPUT_MATERIALIZATION_THREADS", default_value_t = 4)]
    pub output_materialization_threads: usize,

    #[arg(long, env = "REXEC_ENGINE_ADDR", default_value = "grpc+http://[::1]:8980")]
    pub engine_addr: Url,

    #[arg(long, env = "REXEC_CAS_ADDR", default_value = "grpc+http://[::1]:8980")]
    pub cas_addr: Url,

    /// The hash function used for digests.
    #[arg(
        long,
        env = "REXEC_HASH_FUNCTION",
        default_value = "sha256",
        value_parser = PossibleValuesParser::new(["sha256", "sha1", "blake3"])
    )]
    pub hash_function: String,
}

impl RemoteExecutionConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.engine_connections == 0 {
            return Err(Error::InvalidConfig(
                "engine_connections must be at least 1".into(),
            ));
        }
        if self.output_materialization_threads == 0 {
            return Err(Error::InvalidConfig(
                "output_materialization_threads must be at least 1".into(),
            ));
        }
        if self.cas_deadline_secs == 0 {
            return Err(Error::InvalidConfig(
                "cas_deadline_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn cas_deadline(&self) -> Duration {
        Duration::from_secs(self.cas_deadline_secs)
    }
}
