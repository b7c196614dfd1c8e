//! Core entities. Storage layout is unspecified by design; these
//! are the in-memory shapes every subsystem and the `Store` trait agree on.

mod async_invocation;
mod function;
mod sandbox;
mod tenant;
mod workflow;

pub use async_invocation::*;
pub use function::*;
pub use sandbox::*;
pub use tenant::*;
pub use workflow::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifiers. Newtypes avoid mixing up ids across entities.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(FunctionId);
id_type!(InstanceId);
id_type!(AsyncInvocationId);
id_type!(WorkflowId);
id_type!(WorkflowVersionId);
id_type!(RunId);
id_type!(RunNodeId);

/// `(tenant_id, namespace)` pair threaded through every core operation for
/// isolation and quota accounting (Glossary: "Tenant scope").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: String,
    pub namespace: String,
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.namespace)
    }
}
