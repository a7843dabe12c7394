//! Upzone Admin Control Plane
//!
//! The query binding through which operators list zones, describe their
//! peers, add peers and mark them down at runtime. Transports (the HTTP
//! adapter in `upzone-proxy`, a scripting host) only move [`Value`]s in and
//! [`Reply`]s out.

pub mod binding;
pub mod value;

pub use binding::{
    peer_record, Operation, QueryBinding, QueryError, QueryErrorKind, Reply, UnknownOperation,
};
pub use value::Value;
