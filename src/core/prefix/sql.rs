//! Prefix Store backed by the `prefixes` table
//!
//! Each prefix is one row keyed by `(namespace, cidr)`. Root prefixes have a
//! NULL `parent_cidr`; carved children point at their parent. The parent's
//! `body` column holds its acquired children as JSON so a carve reads and
//! rewrites exactly one parent row.

use super::range::{self, PrefixRange};
use super::{PrefixError, PrefixResult, PrefixStore, Usage};
use ipnet::IpNet;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PrefixBody {
    #[serde(default)]
    children: Vec<IpNet>,
}

/// SQL-backed [`PrefixStore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlPrefixStore;

impl SqlPrefixStore {
    pub fn new() -> Self {
        SqlPrefixStore
    }

    fn load(&self, conn: &Connection, namespace: &str, cidr: IpNet) -> PrefixResult<PrefixBody> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM prefixes WHERE namespace = ?1 AND cidr = ?2",
                params![namespace, cidr.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(PrefixError::NotFound {
                namespace: namespace.to_string(),
                cidr,
            }),
        }
    }

    fn save(&self, conn: &Connection, namespace: &str, cidr: IpNet, body: &PrefixBody) -> PrefixResult<()> {
        let json = serde_json::to_string(body)?;
        let updated = conn.execute(
            "UPDATE prefixes SET body = ?3 WHERE namespace = ?1 AND cidr = ?2",
            params![namespace, cidr.to_string(), json],
        )?;
        if updated != 1 {
            return Err(PrefixError::Corrupt(format!(
                "parent {} vanished from namespace {}",
                cidr, namespace
            )));
        }
        Ok(())
    }

    fn insert(
        &self,
        conn: &Connection,
        namespace: &str,
        cidr: IpNet,
        parent: Option<IpNet>,
    ) -> PrefixResult<()> {
        let json = serde_json::to_string(&PrefixBody::default())?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO prefixes (namespace, cidr, parent_cidr, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                namespace,
                cidr.to_string(),
                parent.map(|p| p.to_string()),
                json
            ],
        )?;
        if inserted == 0 {
            return Err(PrefixError::AlreadyExists {
                namespace: namespace.to_string(),
                cidr,
            });
        }
        Ok(())
    }
}

impl PrefixStore for SqlPrefixStore {
    fn create_prefix(&self, conn: &Connection, namespace: &str, cidr: IpNet) -> PrefixResult<()> {
        if cidr.trunc() != cidr {
            return Err(PrefixError::Corrupt(format!("{} has host bits set", cidr)));
        }
        self.insert(conn, namespace, cidr, None)?;
        debug!(namespace, cidr = %cidr, "root prefix created");
        Ok(())
    }

    fn delete_prefix(&self, conn: &Connection, namespace: &str, cidr: IpNet) -> PrefixResult<()> {
        let body = self.load(conn, namespace, cidr)?;
        if !body.children.is_empty() {
            return Err(PrefixError::HasChildren(cidr));
        }
        conn.execute(
            "DELETE FROM prefixes WHERE namespace = ?1 AND cidr = ?2",
            params![namespace, cidr.to_string()],
        )?;
        debug!(namespace, cidr = %cidr, "prefix deleted");
        Ok(())
    }

    fn carve_child(
        &self,
        conn: &Connection,
        namespace: &str,
        parent: IpNet,
        length: u8,
    ) -> PrefixResult<IpNet> {
        if length < parent.prefix_len() || length > range::address_bits(&parent) {
            return Err(PrefixError::InvalidChildLength { parent, length });
        }

        let mut body = self.load(conn, namespace, parent)?;
        let child = range::first_fit(&parent, &body.children, length)
            .ok_or(PrefixError::NoSpace { parent, length })?;

        self.insert(conn, namespace, child, Some(parent))?;
        body.children.push(child);
        self.save(conn, namespace, parent, &body)?;

        debug!(namespace, parent = %parent, cidr = %child, "child prefix carved");
        Ok(child)
    }

    fn release_child(
        &self,
        conn: &Connection,
        namespace: &str,
        parent: IpNet,
        child: IpNet,
    ) -> PrefixResult<()> {
        let mut body = self.load(conn, namespace, parent)?;
        let Some(index) = body.children.iter().position(|c| *c == child) else {
            return Err(PrefixError::NotFound {
                namespace: namespace.to_string(),
                cidr: child,
            });
        };

        body.children.swap_remove(index);
        self.save(conn, namespace, parent, &body)?;
        conn.execute(
            "DELETE FROM prefixes WHERE namespace = ?1 AND cidr = ?2 AND parent_cidr = ?3",
            params![namespace, child.to_string(), parent.to_string()],
        )?;

        debug!(namespace, parent = %parent, cidr = %child, "child prefix released");
        Ok(())
    }

    fn children(&self, conn: &Connection, namespace: &str, parent: IpNet) -> PrefixResult<Vec<IpNet>> {
        let mut children = self.load(conn, namespace, parent)?.children;
        children.sort();
        Ok(children)
    }

    fn read_usage(&self, conn: &Connection, namespace: &str, parent: IpNet) -> PrefixResult<Usage> {
        let children = self.load(conn, namespace, parent)?.children;

        let total = PrefixRange::of(&parent).size();
        let acquired_ips = range::acquired_spans(&children)
            .iter()
            .fold(0u128, |sum, span| sum.saturating_add(span.size()));

        let available_prefixes = range::free_ranges(&parent, &children)
            .iter()
            .flat_map(|free| range::decompose(&parent, free))
            .map(|p| p.to_string())
            .collect();

        Ok(Usage {
            available_ips: total.saturating_sub(acquired_ips),
            acquired_ips,
            acquired_prefixes: children.len() as u64,
            available_prefixes,
        })
    }
}
