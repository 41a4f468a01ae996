//! IP Block glue over the Prefix Store
//!
//! Translates parent [`IpBlock`] rows into prefix store calls and handles the
//! full-grant case, where one constraint takes the whole parent block and
//! nothing is carved.

use crate::core::model::IpBlock;
use crate::core::prefix::{self, range, PrefixError, PrefixStore, Usage};
use crate::core::store::dao;
use crate::error::{AllocError, Result};
use ipnet::IpNet;
use rusqlite::Connection;
use tracing::{debug, info};

/// Prefix store namespace of the block
pub fn namespace_for(block: &IpBlock) -> String {
    prefix::namespace(block.routing_type, block.provider_id, block.site_id)
}

/// Register a parent block's prefix
pub fn register_block(prefixes: &dyn PrefixStore, conn: &Connection, block: &IpBlock) -> Result<()> {
    prefixes.create_prefix(conn, &namespace_for(block), block.prefix)?;
    Ok(())
}

/// A granted child of a parent block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildGrant {
    pub prefix: IpNet,
    /// The whole parent was granted
    pub full_grant: bool,
}

/// Carve a child of `length` for a constraint
///
/// A request for the parent's own length on a parent with no acquired
/// children grants the parent itself and marks it fully granted.
pub fn carve_for_block(
    prefixes: &dyn PrefixStore,
    conn: &Connection,
    parent: &IpBlock,
    length: u8,
) -> Result<ChildGrant> {
    if length < parent.prefix_len() || length > range::address_bits(&parent.prefix) {
        return Err(AllocError::Validation(format!(
            "prefix length /{} is invalid for IP Block {} ({})",
            length, parent.id, parent.prefix
        )));
    }
    let ns = namespace_for(parent);

    if parent.full_grant {
        return Err(exhausted(prefixes, conn, &ns, parent, length));
    }

    if length == parent.prefix_len() {
        if !prefixes.children(conn, &ns, parent.prefix)?.is_empty() {
            return Err(exhausted(prefixes, conn, &ns, parent, length));
        }
        dao::set_full_grant(conn, parent.id, true)?;
        debug!(ip_block_id = %parent.id, cidr = %parent.prefix, "parent block fully granted");
        return Ok(ChildGrant {
            prefix: parent.prefix,
            full_grant: true,
        });
    }

    match prefixes.carve_child(conn, &ns, parent.prefix, length) {
        Ok(child) => Ok(ChildGrant {
            prefix: child,
            full_grant: false,
        }),
        Err(PrefixError::NoSpace { .. }) => Err(exhausted(prefixes, conn, &ns, parent, length)),
        Err(e) => Err(e.into()),
    }
}

/// Conflict carrying the parent's usage, logged for diagnosis
fn exhausted(
    prefixes: &dyn PrefixStore,
    conn: &Connection,
    ns: &str,
    parent: &IpBlock,
    length: u8,
) -> AllocError {
    let usage = usage_in(prefixes, conn, ns, parent).ok();
    if let Some(usage) = &usage {
        info!(
            ip_block_id = %parent.id,
            cidr = %parent.prefix,
            available_ips = %usage.available_ips,
            acquired_ips = %usage.acquired_ips,
            acquired_prefixes = usage.acquired_prefixes,
            available_prefixes = ?usage.available_prefixes,
            "parent block usage"
        );
    }
    AllocError::Conflict {
        message: format!(
            "IP Block {} ({}) has no space left for a /{}",
            parent.id, parent.prefix, length
        ),
        conflicting_id: Some(parent.id),
        usage: usage.map(Box::new),
    }
}

/// Return a derived block's prefix to its parent
///
/// Releasing a prefix that is already gone is not an error.
pub fn release_for_block(
    prefixes: &dyn PrefixStore,
    conn: &Connection,
    parent: &IpBlock,
    child: IpNet,
) -> Result<()> {
    if parent.full_grant && child == parent.prefix {
        dao::set_full_grant(conn, parent.id, false)?;
        debug!(ip_block_id = %parent.id, cidr = %child, "full grant cleared");
        return Ok(());
    }

    match prefixes.release_child(conn, &namespace_for(parent), parent.prefix, child) {
        Ok(()) => Ok(()),
        Err(PrefixError::NotFound { .. }) => {
            debug!(ip_block_id = %parent.id, cidr = %child, "child prefix already released");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Usage of a parent block
pub fn usage_for_block(prefixes: &dyn PrefixStore, conn: &Connection, parent: &IpBlock) -> Result<Usage> {
    Ok(usage_in(prefixes, conn, &namespace_for(parent), parent)?)
}

fn usage_in(
    prefixes: &dyn PrefixStore,
    conn: &Connection,
    ns: &str,
    parent: &IpBlock,
) -> std::result::Result<Usage, PrefixError> {
    if parent.full_grant {
        let size = range::PrefixRange::of(&parent.prefix).size();
        return Ok(Usage {
            available_ips: 0,
            acquired_ips: size,
            acquired_prefixes: 1,
            available_prefixes: Vec::new(),
        });
    }
    prefixes.read_usage(conn, ns, parent.prefix)
}
