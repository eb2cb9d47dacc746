use std::marker::PhantomData;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};
use crate::proto::capstan::common as gen;

pub trait IdValueType: Sized {
    fn first() -> Self;
    fn next(v: Self) -> ClusterResult<Self>;
}

macro_rules! impl_integer_id_value_type {
    ($type:ty) => {
        impl IdValueType for $type {
            fn first() -> Self {
                1
            }

            fn next(v: Self) -> ClusterResult<Self> {
                v.checked_add(1)
                    .ok_or(ClusterError::InternalError("ID overflow".to_string()))
            }
        }
    };
}

impl_integer_id_value_type!(u64);

pub trait IdType: Sized {
    type Value: IdValueType + From<Self> + Into<Self>;
}

macro_rules! define_id_type {
    ($name:ident, $value_type:ty) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub struct $name($value_type);

        impl IdType for $name {
            type Value = $value_type;
        }

        impl From<$value_type> for $name {
            fn from(id: $value_type) -> Self {
                Self(id)
            }
        }

        impl From<$name> for $value_type {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// The per-registration identity of a task executor.
/// A fresh instance ID is generated every time a task executor registers,
/// so messages scoped by an earlier instance ID can be detected as stale.
define_id_type!(InstanceId, u64);

macro_rules! define_name_id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// The stable identity of a physical host or process.
/// It does not change when the process reconnects.
define_name_id_type!(ResourceId);

/// The identity of a job, stable for the lifetime of the job.
define_name_id_type!(JobId);

/// The identity of one slot reservation, minted by a job manager.
define_name_id_type!(AllocationId);

macro_rules! define_fencing_token_type {
    ($name:ident) => {
        /// A leadership epoch token. RPC traffic carrying a token from a
        /// stale epoch is rejected before it reaches any handler.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = ClusterError;

            fn from_str(s: &str) -> ClusterResult<Self> {
                Uuid::from_str(s).map(Self).map_err(|e| {
                    ClusterError::InvalidArgument(format!(
                        "invalid {} value {s}: {e}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_fencing_token_type!(ResourceManagerId);
define_fencing_token_type!(JobMasterId);

/// The identity of one execution slot hosted by a task executor.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SlotId {
    pub resource_id: ResourceId,
    pub slot_number: u32,
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.resource_id, self.slot_number)
    }
}

impl From<gen::SlotId> for SlotId {
    fn from(value: gen::SlotId) -> Self {
        Self {
            resource_id: value.resource_id.into(),
            slot_number: value.slot_number,
        }
    }
}

impl From<SlotId> for gen::SlotId {
    fn from(value: SlotId) -> Self {
        Self {
            resource_id: value.resource_id.into(),
            slot_number: value.slot_number,
        }
    }
}

#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_value: T::Value,
    phantom: PhantomData<T>,
}

impl<T: IdType> Default for IdGenerator<T>
where
    T::Value: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IdType> IdGenerator<T>
where
    T::Value: Copy,
{
    pub fn new() -> Self {
        Self {
            next_value: T::Value::first(),
            phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> ClusterResult<T> {
        let value = self.next_value;
        self.next_value = T::Value::next(value)?;
        Ok(value.into())
    }
}
