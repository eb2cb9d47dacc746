use capstan_server::actor::ActorHandle;
use capstan_server::ServerBuilder;
use tokio::net::{TcpListener, ToSocketAddrs};
use tonic::codec::CompressionEncoding;

use crate::error::{ClusterError, ClusterResult};
use crate::manager::event::ResourceManagerEvent;
use crate::manager::gen::resource_manager_service_server::ResourceManagerServiceServer;
use crate::manager::server::ResourceManagerServer;
use crate::manager::ResourceManagerActor;

impl ResourceManagerActor {
    pub(super) async fn serve(
        handle: ActorHandle<Self>,
        addr: impl ToSocketAddrs + Send,
    ) -> ClusterResult<()> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let server = ResourceManagerServer::new(handle.clone());
        let service = ResourceManagerServiceServer::new(server)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Zstd);

        handle
            .send(ResourceManagerEvent::ServerReady { port, signal: tx })
            .await?;

        ServerBuilder::new("capstan_resource_manager", Default::default())
            .add_service(service, Some(crate::proto::FILE_DESCRIPTOR_SET))
            .await
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .map_err(|e| ClusterError::InternalError(e.to_string()))
    }
}
