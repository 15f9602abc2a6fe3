//! Domain model (IDs, registry records, session state, resources, verdicts, errors).
//!
//! ドメイン層は I/O を持たない。レジストリや Provisioner との通信は ports 経由で app 層が行う。

pub mod errors;
pub mod ids;
pub mod records;
pub mod resource;
pub mod session;
pub mod verdict;

pub use self::errors::{ErrorKind, LeaseError, ProvisionError, RegistryError, SessionError};
pub use self::ids::{IdError, ResourceId, SessionId};
pub use self::records::{Lease, LeaseStatus, ResourceMapping, StatusRecord};
pub use self::resource::{
    MachineConfig, Resource, ResourceFilter, ResourceState, StopConfig, resource_name,
    session_from_name,
};
pub use self::session::{Session, SessionStatus};
pub use self::verdict::{Limits, ReclaimReason, evaluate};
