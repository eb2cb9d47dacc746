//! Generated protocol definitions for the cluster RPC surfaces.
//! The server and client types are public so that remote participants
//! (and test harnesses) can be built against the same definitions.

#[allow(clippy::all)]
pub mod capstan {
    pub mod common {
        tonic::include_proto!("capstan.common");
    }

    pub mod resource_manager {
        tonic::include_proto!("capstan.resource_manager");
    }

    pub mod job_manager {
        tonic::include_proto!("capstan.job_manager");
    }

    pub mod task_executor {
        tonic::include_proto!("capstan.task_executor");
    }
}

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("capstan_descriptor");
