mod client;

pub use client::TaskExecutorClient;

use crate::proto::capstan::common as gen;

/// The kind of file that can be fetched from a task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Stdout,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::Log => write!(f, "LOG"),
            FileType::Stdout => write!(f, "STDOUT"),
        }
    }
}

impl TryFrom<gen::FileType> for FileType {
    type Error = crate::error::ClusterError;

    fn try_from(value: gen::FileType) -> Result<Self, Self::Error> {
        match value {
            gen::FileType::Log => Ok(Self::Log),
            gen::FileType::Stdout => Ok(Self::Stdout),
            gen::FileType::Unspecified => Err(crate::error::ClusterError::InvalidArgument(
                "unspecified file type".to_string(),
            )),
        }
    }
}

impl From<FileType> for gen::FileType {
    fn from(value: FileType) -> Self {
        match value {
            FileType::Log => Self::Log,
            FileType::Stdout => Self::Stdout,
        }
    }
}
