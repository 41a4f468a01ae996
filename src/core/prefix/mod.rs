//! Prefix Store: hierarchical address prefixes per namespace
//!
//! A parent prefix is registered once, then children of a requested length
//! are carved from its free space and released again. Every operation runs on
//! the caller's open connection so carved prefixes commit or roll back with
//! the surrounding transaction.

pub mod range;
pub mod sql;

pub use sql::SqlPrefixStore;

use crate::core::model::RoutingType;
use ipnet::IpNet;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type PrefixResult<T> = std::result::Result<T, PrefixError>;

#[derive(Error, Debug)]
pub enum PrefixError {
    /// Parent has no free aligned range of the requested length
    #[error("no space left in {parent} for a /{length}")]
    NoSpace { parent: IpNet, length: u8 },

    #[error("prefix {cidr} not found in namespace {namespace}")]
    NotFound { namespace: String, cidr: IpNet },

    #[error("prefix {cidr} already exists in namespace {namespace}")]
    AlreadyExists { namespace: String, cidr: IpNet },

    /// Requested child is shorter than the parent or longer than the family allows
    #[error("invalid child length /{length} for parent {parent}")]
    InvalidChildLength { parent: IpNet, length: u8 },

    #[error("prefix {0} still has acquired children")]
    HasChildren(IpNet),

    #[error("corrupt prefix record: {0}")]
    Corrupt(String),

    #[error("prefix database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("prefix record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Utilization snapshot of one parent prefix
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub available_ips: u128,
    pub acquired_ips: u128,
    pub acquired_prefixes: u64,
    /// Free space as maximal aligned prefixes
    pub available_prefixes: Vec<String>,
}

/// Operations the allocation engine needs from a prefix store
pub trait PrefixStore: Send + Sync {
    /// Register a root prefix
    fn create_prefix(&self, conn: &Connection, namespace: &str, cidr: IpNet) -> PrefixResult<()>;

    /// Remove a root prefix that has no acquired children
    fn delete_prefix(&self, conn: &Connection, namespace: &str, cidr: IpNet) -> PrefixResult<()>;

    /// Carve a child of `length` from the parent's free space
    fn carve_child(
        &self,
        conn: &Connection,
        namespace: &str,
        parent: IpNet,
        length: u8,
    ) -> PrefixResult<IpNet>;

    /// Return a child to the parent; `NotFound` if it is not acquired
    fn release_child(
        &self,
        conn: &Connection,
        namespace: &str,
        parent: IpNet,
        child: IpNet,
    ) -> PrefixResult<()>;

    /// Acquired children of the parent
    fn children(&self, conn: &Connection, namespace: &str, parent: IpNet) -> PrefixResult<Vec<IpNet>>;

    fn read_usage(&self, conn: &Connection, namespace: &str, parent: IpNet) -> PrefixResult<Usage>;
}

/// Namespace isolating prefixes of one routing type, provider and site
pub fn namespace(routing_type: RoutingType, provider_id: Uuid, site_id: Uuid) -> String {
    format!("{}/{}/{}", routing_type, provider_id, site_id)
}
