use std::sync::Arc;

use rexec_castore::proto::{
    BuildInfo, CasClientInfo, CreatorInfo, ReSessionId, RemoteExecutionMetadata,
};

/// Supplies the metadata attached to outbound requests.
///
/// Queried once per constructed storage or execution client, the returned
/// value is then used for every call made by that client.
pub trait MetadataProvider: Send + Sync {
    fn get(&self) -> RemoteExecutionMetadata;
}

impl<F> MetadataProvider for F
where
    F: Fn() -> RemoteExecutionMetadata + Send + Sync,
{
    fn get(&self) -> RemoteExecutionMetadata {
        self()
    }
}

/// Always hands out the same metadata.
#[derive(Clone, Debug, Default)]
pub struct StaticMetadataProvider(RemoteExecutionMetadata);

impl StaticMetadataProvider {
    pub fn new(metadata: RemoteExecutionMetadata) -> Self {
        Self(metadata)
    }

    /// Metadata for one session of the `rexec` tool: a fresh session and
    /// build id, and the invoking user as creator.
    pub fn for_session(client_type: &str) -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        Self(RemoteExecutionMetadata {
            re_session_id: Some(ReSessionId {
                id: uuid::Uuid::new_v4().to_string(),
            }),
            build_info: Some(BuildInfo {
                build_id: uuid::Uuid::new_v4().to_string(),
                rule_name: String::new(),
            }),
            creator_info: Some(CreatorInfo {
                username,
                client_type: client_type.to_string(),
            }),
            cas_client_info: Some(CasClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
            }),
            ..Default::default()
        })
    }

    pub fn into_arc(self) -> Arc<dyn MetadataProvider> {
        Arc::new(self)
    }
}

impl MetadataProvider for StaticMetadataProvider {
    fn get(&self) -> RemoteExecutionMetadata {
        self.0.clone()
    }
}
