use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::error::{ClusterError, ClusterResult};
use crate::proto::capstan::job_manager::job_manager_service_client::JobManagerServiceClient;
use crate::proto::capstan::task_executor::task_executor_service_client::TaskExecutorServiceClient;

pub enum ServerMonitor {
    Stopped,
    Pending {
        handle: JoinHandle<ClusterResult<()>>,
    },
    Running {
        /// The shutdown signal to send to the server.
        signal: oneshot::Sender<()>,
        /// The join handle of the server task.
        handle: JoinHandle<ClusterResult<()>>,
        /// The server port.
        port: u16,
    },
}

impl Default for ServerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self::Stopped
    }

    pub async fn start(
        self,
        f: impl Future<Output = ClusterResult<()>> + Send + 'static,
    ) -> Self {
        self.stop().await;
        Self::Pending {
            handle: tokio::spawn(f),
        }
    }

    pub fn ready(self, signal: oneshot::Sender<()>, port: u16) -> ClusterResult<Self> {
        match self {
            Self::Pending { handle } => Ok(Self::Running {
                signal,
                handle,
                port,
            }),
            _ => Err(ClusterError::InternalError(
                "the server must be in pending state before it can be ready".to_string(),
            )),
        }
    }

    pub async fn stop(self) {
        match self {
            Self::Stopped => {}
            Self::Pending { handle } => {
                handle.abort();
            }
            Self::Running {
                signal,
                handle,
                port: _,
            } => {
                let _ = signal.send(());
                let _ = handle.await;
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Running { port, .. } => Some(*port),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub enable_tls: bool,
    pub host: String,
    pub port: u16,
}

impl ClientOptions {
    pub fn to_url_string(&self) -> String {
        let scheme = if self.enable_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn from_address(enable_tls: bool, address: &str) -> ClusterResult<Self> {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            ClusterError::InvalidArgument(format!("invalid address: {address}"))
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            ClusterError::InvalidArgument(format!("invalid port in address: {address}"))
        })?;
        Ok(Self {
            enable_tls,
            host: host.to_string(),
            port,
        })
    }
}

#[tonic::async_trait]
pub trait ClientBuilder: Sized {
    async fn connect(options: &ClientOptions) -> ClusterResult<Self>;
}

macro_rules! impl_client_builder {
    ($client_type:ty) => {
        #[tonic::async_trait]
        impl ClientBuilder for $client_type {
            async fn connect(options: &ClientOptions) -> ClusterResult<Self> {
                Ok(<$client_type>::connect(options.to_url_string()).await?)
            }
        }
    };
}

impl_client_builder!(JobManagerServiceClient<Channel>);
impl_client_builder!(TaskExecutorServiceClient<Channel>);

/// A handle to a gRPC client to support connection reuse.
/// The handle can be cheaply cloned and the underlying connection is shared.
#[derive(Debug, Clone)]
pub struct ClientHandle<T> {
    /// The client options.
    options: Arc<ClientOptions>,
    /// The shared gRPC client which is lazily initialized.
    /// Note that this must be `Arc<OnceCell<Mutex<T>>>` instead of `OnceCell<Arc<Mutex<T>>>`.
    /// If we use the latter, when the client is not initialized, an empty `OnceCell` would be
    /// cloned and later initialized independently, resulting in multiple connections.
    inner: Arc<OnceCell<Mutex<T>>>,
}

impl<T: ClientBuilder> ClientHandle<T> {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: Arc::new(options),
            inner: Arc::new(OnceCell::new()),
        }
    }

    async fn init(options: Arc<ClientOptions>) -> ClusterResult<Mutex<T>> {
        let client = T::connect(&options).await?;
        Ok(Mutex::new(client))
    }

    async fn get(&self) -> ClusterResult<&Mutex<T>> {
        let options = Arc::clone(&self.options);
        self.inner.get_or_try_init(|| Self::init(options)).await
    }

    pub async fn lock(&self) -> ClusterResult<MutexGuard<'_, T>> {
        Ok(self.get().await?.lock().await)
    }
}
