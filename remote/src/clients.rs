use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rexec_castore::cas::{materialize_outputs, GrpcCas};
use rexec_castore::tonic::{GrpcChannel, ManagedChannel};
use rexec_castore::{protocol_from_name, Protocol};
use tracing::{debug, instrument};

use crate::channel_pool::{close_channels, ChannelPool, CLOSE_WAIT};
use crate::execution::{check_output_path, GrpcRemoteExecutionService, OutputFile};
use crate::{Error, MetadataProvider, RemoteExecutionConfig};

/// The clients needed to execute actions remotely: a pool of connections
/// to the execution engine, and one connection to the CAS.
///
/// [RemoteExecutionClients::close] has to be called before dropping it.
pub struct RemoteExecutionClients {
    engines: ChannelPool<Arc<GrpcChannel>>,
    cas_channel: Arc<GrpcChannel>,
    storage: Arc<GrpcCas>,
    protocol: Arc<dyn Protocol>,
    metadata_provider: Arc<dyn MetadataProvider>,
    instance_name: String,
    deadline: Duration,
    output_materialization_threads: usize,
    closed: AtomicBool,
}

impl RemoteExecutionClients {
    pub fn new(
        instance_name: impl Into<String>,
        engine_channels: Vec<Arc<GrpcChannel>>,
        cas_channel: Arc<GrpcChannel>,
        deadline: Duration,
        output_materialization_threads: usize,
        protocol: Arc<dyn Protocol>,
        metadata_provider: Arc<dyn MetadataProvider>,
    ) -> Result<Self, Error> {
        let instance_name = instance_name.into();
        let engines = ChannelPool::new(engine_channels)?;

        let storage = Arc::new(GrpcCas::new(
            cas_channel.clone(),
            protocol.clone(),
            instance_name.clone(),
            deadline,
            metadata_provider.get(),
        ));

        Ok(Self {
            engines,
            cas_channel,
            storage,
            protocol,
            metadata_provider,
            instance_name,
            deadline,
            output_materialization_threads,
            closed: AtomicBool::new(false),
        })
    }

    /// Connects to the endpoints in `config`, opening
    /// `config.engine_connections` independent connections to the execution
    /// engine.
    #[instrument(skip_all, fields(engine = %config.engine_addr, cas = %config.cas_addr), err)]
    pub async fn from_config(
        config: &RemoteExecutionConfig,
        metadata_provider: Arc<dyn MetadataProvider>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let protocol: Arc<dyn Protocol> = protocol_from_name(&config.hash_function)
            .ok_or_else(|| {
                Error::InvalidConfig(format!("unknown hash function {}", config.hash_function))
            })?
            .into();

        let mut engine_channels = Vec::with_capacity(config.engine_connections);
        for _ in 0..config.engine_connections {
            engine_channels.push(Arc::new(GrpcChannel::from_url(&config.engine_addr).await?));
        }
        let cas_channel = Arc::new(GrpcChannel::from_url(&config.cas_addr).await?);

        debug!(engine_connections = engine_channels.len(), "connected");

        Self::new(
            config.instance_name.clone(),
            engine_channels,
            cas_channel,
            config.cas_deadline(),
            config.output_materialization_threads,
            protocol,
            metadata_provider,
        )
    }

    /// Returns an execution client bound to the next engine connection.
    pub fn remote_execution_service(&self) -> GrpcRemoteExecutionService {
        GrpcRemoteExecutionService::new(
            self.engines.select().clone(),
            self.instance_name.clone(),
            self.deadline,
            self.metadata_provider.get(),
        )
    }

    pub fn storage(&self) -> Arc<GrpcCas> {
        self.storage.clone()
    }

    pub fn protocol(&self) -> Arc<dyn Protocol> {
        self.protocol.clone()
    }

    /// Downloads `outputs` below `root`, with as many downloads in flight as
    /// configured. Fails without writing anything if a path would end up
    /// outside of `root`.
    pub async fn materialize(&self, outputs: &[OutputFile], root: &Path) -> Result<(), Error> {
        let outputs = outputs
            .iter()
            .map(|output| {
                check_output_path(&output.path)?;
                Ok((output.digest.clone(), root.join(&output.path)))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        materialize_outputs(
            self.storage.as_ref(),
            outputs,
            self.output_materialization_threads,
        )
        .await?;
        Ok(())
    }

    /// Closes all engine connections, then the CAS connection.
    ///
    /// All of them are attempted even if closing one fails, the first
    /// failure is returned. Only the first call does anything.
    #[instrument(skip_all, err)]
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("already closed");
            return Ok(());
        }

        let channels = self
            .engines
            .channels()
            .iter()
            .chain(std::iter::once(&self.cas_channel))
            .map(|channel| channel as &dyn ManagedChannel);

        close_channels(channels, CLOSE_WAIT).await
    }
}
