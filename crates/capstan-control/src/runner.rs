use capstan_server::actor::{ActorHandle, ActorSystem};

use crate::error::ClusterResult;
use crate::manager::event::ResourceManagerEvent;
use crate::manager::options::ResourceManagerOptions;
use crate::manager::ResourceManagerActor;

/// Runs a resource manager endpoint on its own actor system.
pub struct ResourceManagerRunner {
    system: ActorSystem,
    handle: ActorHandle<ResourceManagerActor>,
}

impl ResourceManagerRunner {
    pub fn new(options: ResourceManagerOptions) -> Self {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<ResourceManagerActor>(options);
        Self { system, handle }
    }

    pub fn handle(&self) -> &ActorHandle<ResourceManagerActor> {
        &self.handle
    }

    /// Wait until the resource manager stops on its own
    /// (e.g. through a fatal error handler that shuts it down).
    pub async fn join(mut self) {
        self.system.join().await;
    }

    /// Ask the resource manager to stop and wait for it to finish.
    pub async fn shutdown(mut self) -> ClusterResult<()> {
        self.handle.send(ResourceManagerEvent::Shutdown).await?;
        self.system.join().await;
        Ok(())
    }
}
