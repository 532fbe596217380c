use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Request;

use crate::proto::google::spanner::v1 as proto;
use crate::proto::google::spanner::v1::spanner_client::SpannerClient;
use crate::Error;

/// The slice of the Cloud Spanner API the session layer depends on.
///
/// Implementations attach `md` to every outgoing request; the pool uses it to
/// stamp routing headers such as `google-cloud-resource-prefix`.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session on `database` and returns its server-assigned name.
    async fn create_session(
        &self,
        database: &str,
        labels: &HashMap<String, String>,
        md: &MetadataMap,
    ) -> Result<String, Error>;

    /// Fetches a session by name. The pool uses this as a liveness ping.
    async fn get_session(&self, name: &str, md: &MetadataMap) -> Result<(), Error>;

    /// Deletes a session by name.
    async fn delete_session(&self, name: &str, md: &MetadataMap) -> Result<(), Error>;

    /// Begins a read-write transaction on the session and returns its id.
    async fn begin_transaction(&self, session: &str, md: &MetadataMap) -> Result<Vec<u8>, Error>;
}

/// `SessionService` over a single gRPC channel.
///
/// Every session created through one of these stays on its channel for all
/// subsequent RPCs.
#[derive(Clone)]
pub struct GrpcSessionService {
    client: SpannerClient<Channel>,
}

impl GrpcSessionService {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: SpannerClient::new(channel),
        }
    }

    pub async fn connect(endpoint: String) -> Result<Self, Error> {
        let channel = Channel::from_shared(endpoint)
            .map_err(|invalid_uri| Error::InvalidConfig(format!("invalid endpoint: {invalid_uri}")))?
            .connect()
            .await?;
        Ok(Self::new(channel))
    }
}

fn with_metadata<T>(message: T, md: &MetadataMap) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = md.clone();
    request
}

#[async_trait]
impl SessionService for GrpcSessionService {
    async fn create_session(
        &self,
        database: &str,
        labels: &HashMap<String, String>,
        md: &MetadataMap,
    ) -> Result<String, Error> {
        let mut client = self.client.clone();
        let response = client
            .create_session(with_metadata(
                proto::CreateSessionRequest {
                    database: database.to_string(),
                    session: Some(proto::Session {
                        labels: labels.clone(),
                        ..Default::default()
                    }),
                },
                md,
            ))
            .await?;
        Ok(response.into_inner().name)
    }

    async fn get_session(&self, name: &str, md: &MetadataMap) -> Result<(), Error> {
        let mut client = self.client.clone();
        client
            .get_session(with_metadata(
                proto::GetSessionRequest {
                    name: name.to_string(),
                },
                md,
            ))
            .await?;
        Ok(())
    }

    async fn delete_session(&self, name: &str, md: &MetadataMap) -> Result<(), Error> {
        let mut client = self.client.clone();
        client
            .delete_session(with_metadata(
                proto::DeleteSessionRequest {
                    name: name.to_string(),
                },
                md,
            ))
            .await?;
        Ok(())
    }

    async fn begin_transaction(&self, session: &str, md: &MetadataMap) -> Result<Vec<u8>, Error> {
        let mut client = self.client.clone();
        let response = client
            .begin_transaction(with_metadata(
                proto::BeginTransactionRequest {
                    session: session.to_string(),
                    options: Some(proto::TransactionOptions {
                        mode: Some(proto::transaction_options::Mode::ReadWrite(
                            proto::transaction_options::ReadWrite::default(),
                        )),
                    }),
                },
                md,
            ))
            .await?;
        Ok(response.into_inner().id)
    }
}

/// Caller-supplied hook handing out RPC channels, so an outer client can
/// spread the sessions of one pool across a channel pool.
#[derive(Clone)]
pub struct RpcClientFactory(
    Arc<dyn Fn() -> Result<Arc<dyn SessionService>, Error> + Send + Sync>,
);

impl RpcClientFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn SessionService>, Error> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A factory that hands every session the same service.
    pub fn from_service(service: Arc<dyn SessionService>) -> Self {
        Self::new(move || Ok(service.clone()))
    }

    pub(crate) fn get(&self) -> Result<Arc<dyn SessionService>, Error> {
        (self.0)()
    }
}

impl fmt::Debug for RpcClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RpcClientFactory")
    }
}
