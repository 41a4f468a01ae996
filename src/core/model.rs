//! Entity types owned or read by the allocation engine
//!
//! Ownership is a tree: an [`Allocation`] owns its [`AllocationConstraint`]s,
//! and an IP Block constraint owns the derived [`IpBlock`] it carved. Instances
//! and subnets point back at constraints and derived blocks by id only.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

string_enum!(
    /// Kind of resource a constraint draws from
    ResourceType {
        InstanceType => "InstanceType",
        IpBlock => "IPBlock",
    }
);

string_enum!(
    /// Reservation discipline of a constraint; only `Reserved` is admitted
    ConstraintType {
        Reserved => "Reserved",
        OnDemand => "OnDemand",
        Preemptible => "Preemptible",
    }
);

string_enum!(
    AllocationStatus {
        Pending => "Pending",
        Registered => "Registered",
        Error => "Error",
        Deleting => "Deleting",
    }
);

string_enum!(
    RoutingType {
        Public => "Public",
        DatacenterOnly => "DatacenterOnly",
    }
);

string_enum!(
    ProtocolVersion {
        V4 => "IPv4",
        V6 => "IPv6",
    }
);

string_enum!(
    IpBlockStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
);

/// A tenant's named reservation at one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    /// Unique per (tenant, site)
    pub name: String,
    pub description: Option<String>,
    pub status: AllocationStatus,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// One reserved resource attached to an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConstraint {
    pub id: Uuid,
    pub allocation_id: Uuid,
    pub resource_type: ResourceType,
    /// Instance Type id, or parent IP Block id
    pub resource_type_id: Uuid,
    pub constraint_type: ConstraintType,
    /// Reserved machine count, or requested prefix length
    pub constraint_value: i64,
    /// Carved child IP Block, set for IP Block constraints only
    pub derived_resource_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// An allocation together with its constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDetail {
    #[serde(flatten)]
    pub allocation: Allocation,
    pub constraints: Vec<AllocationConstraint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub provider_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub org: String,
    pub org_display_name: Option<String>,
}

impl Tenant {
    /// Name shown on the remote site, falling back to the org
    pub fn display_name(&self) -> &str {
        self.org_display_name.as_deref().unwrap_or(&self.org)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceType {
    pub id: Uuid,
    pub name: String,
    pub provider_id: Uuid,
    /// `None` means the type is not pinned to a site
    pub site_id: Option<Uuid>,
}

/// Address space entity: either a provider-owned parent block or a
/// tenant-owned block derived from one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlock {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub site_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub routing_type: RoutingType,
    pub prefix: IpNet,
    pub protocol_version: ProtocolVersion,
    pub status: IpBlockStatus,
    /// Whole block has been granted to one constraint
    pub full_grant: bool,
    pub created: DateTime<Utc>,
}

impl IpBlock {
    pub fn prefix_len(&self) -> u8 {
        self.prefix.prefix_len()
    }
}

/// Marks a tenant as active on a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSite {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
}

/// Status history entry for an allocation or derived block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub status: String,
    pub message: Option<String>,
    pub created: DateTime<Utc>,
}

/// Protocol version implied by a prefix
pub fn protocol_version_of(prefix: &IpNet) -> ProtocolVersion {
    match prefix {
        IpNet::V4(_) => ProtocolVersion::V4,
        IpNet::V6(_) => ProtocolVersion::V6,
    }
}
