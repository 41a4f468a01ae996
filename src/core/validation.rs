//! Request types and fail-fast validation
//!
//! Everything here runs before a transaction opens or a lock is taken, so a
//! malformed request never costs a database round trip.

use crate::core::model::{ConstraintType, ResourceType};
use crate::error::{AllocError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Validated allocation name
///
/// # Rules
/// - Starts with a letter or digit
/// - Letters, digits, spaces, `.`, `_` and `-` only
/// - No trailing whitespace
/// - Length: 2-256 characters
///
/// Valid: "gpu-pool", "Team A reserve", "v1.2_batch"
///
/// Invalid: "-pool" (leading hyphen), "pool " (trailing space), "a/b" (slash)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationName(String);

impl AllocationName {
    const PATTERN: &'static str = r"^[A-Za-z0-9][A-Za-z0-9 ._-]*$";

    pub const MIN_LENGTH: usize = 2;
    pub const MAX_LENGTH: usize = 256;

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::check(&name)?;
        Ok(AllocationName(name))
    }

    fn check(name: &str) -> Result<()> {
        let len = name.chars().count();
        if len < Self::MIN_LENGTH || len > Self::MAX_LENGTH {
            return Err(AllocError::Validation(format!(
                "name must be {}-{} characters",
                Self::MIN_LENGTH,
                Self::MAX_LENGTH
            )));
        }

        let re = Regex::new(Self::PATTERN).map_err(|e| AllocError::Internal(e.to_string()))?;
        if !re.is_match(name) {
            return Err(AllocError::Validation(format!(
                "name '{}' may only contain letters, digits, spaces, '.', '_' and '-', and must start with a letter or digit",
                name
            )));
        }

        if name.ends_with(' ') {
            return Err(AllocError::Validation(
                "name cannot end with whitespace".to_string(),
            ));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for AllocationName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AllocationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_name(name: &str) -> std::result::Result<(), ValidationError> {
    AllocationName::check(name).map_err(|e| {
        let mut err = ValidationError::new("name");
        err.message = Some(e.to_string().into());
        err
    })
}

/// One requested constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ConstraintRequest {
    pub resource_type: ResourceType,
    /// Instance Type id, or parent IP Block id
    pub resource_type_id: Uuid,
    pub constraint_type: ConstraintType,
    /// Machine count, or prefix length
    #[validate(range(min = 1))]
    pub constraint_value: i64,
}

/// Request to create an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateAllocationRequest {
    #[validate(custom(function = "validate_name"))]
    pub name: String,
    #[validate(length(max = 1024))]
    pub description: Option<String>,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    #[validate(length(min = 1), nested)]
    pub constraints: Vec<ConstraintRequest>,
}

impl CreateAllocationRequest {
    /// Structural checks plus the cross-field rules derive cannot express
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        let mut seen = HashSet::new();
        for c in &self.constraints {
            if !seen.insert(c.resource_type_id) {
                return Err(AllocError::Validation(format!(
                    "resource type id {} appears in more than one constraint",
                    c.resource_type_id
                )));
            }
            check_constraint_value(c.resource_type, c.constraint_type, c.constraint_value)?;
        }
        Ok(())
    }
}

/// Request to change one constraint's value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UpdateConstraintRequest {
    pub constraint_id: Uuid,
    #[validate(range(min = 1))]
    pub constraint_value: i64,
}

impl UpdateConstraintRequest {
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        Ok(())
    }
}

/// Request to rename an allocation or change its description
///
/// Fields left `None` keep their current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UpdateAllocationRequest {
    pub allocation_id: Uuid,
    #[validate(custom(function = "validate_name"))]
    pub name: Option<String>,
    #[validate(length(max = 1024))]
    pub description: Option<String>,
}

impl UpdateAllocationRequest {
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        Ok(())
    }
}

/// Rules that depend on the resource kind
pub fn check_constraint_value(
    resource_type: ResourceType,
    constraint_type: ConstraintType,
    value: i64,
) -> Result<()> {
    match resource_type {
        ResourceType::InstanceType => {
            if constraint_type != ConstraintType::Reserved {
                return Err(AllocError::Validation(format!(
                    "constraint type {} is not supported for Instance Type constraints, only Reserved",
                    constraint_type
                )));
            }
        }
        ResourceType::IpBlock => {
            if !(1..=128).contains(&value) {
                return Err(AllocError::Validation(format!(
                    "prefix length {} is out of range",
                    value
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_constraint(id: Uuid, value: i64) -> ConstraintRequest {
        ConstraintRequest {
            resource_type: ResourceType::InstanceType,
            resource_type_id: id,
            constraint_type: ConstraintType::Reserved,
            constraint_value: value,
        }
    }

    fn request(constraints: Vec<ConstraintRequest>) -> CreateAllocationRequest {
        CreateAllocationRequest {
            name: "gpu-pool".into(),
            description: None,
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            constraints,
        }
    }

    #[test]
    fn test_valid_names() {
        assert!(AllocationName::new("gpu-pool").is_ok());
        assert!(AllocationName::new("Team A reserve").is_ok());
        assert!(AllocationName::new("v1.2_batch").is_ok());
        assert!(AllocationName::new("ab").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(AllocationName::new("a").is_err()); // too short
        assert!(AllocationName::new("-pool").is_err()); // leading hyphen
        assert!(AllocationName::new("pool ").is_err()); // trailing space
        assert!(AllocationName::new("a/b").is_err()); // slash
        assert!(AllocationName::new("x".repeat(257)).is_err());
    }

    #[test]
    fn test_request_ok() {
        let req = request(vec![instance_constraint(Uuid::new_v4(), 2)]);
        req.check().unwrap();
    }

    #[test]
    fn test_request_requires_constraints() {
        let err = request(vec![]).check().unwrap_err();
        assert!(matches!(err, AllocError::Validation(_)));
    }

    #[test]
    fn test_request_rejects_bad_name() {
        let mut req = request(vec![instance_constraint(Uuid::new_v4(), 1)]);
        req.name = "bad/name".into();
        assert!(matches!(req.check(), Err(AllocError::Validation(_))));
    }

    #[test]
    fn test_request_rejects_zero_value() {
        let req = request(vec![instance_constraint(Uuid::new_v4(), 0)]);
        assert!(matches!(req.check(), Err(AllocError::Validation(_))));
    }

    #[test]
    fn test_request_rejects_duplicate_resource() {
        let id = Uuid::new_v4();
        let req = request(vec![instance_constraint(id, 1), instance_constraint(id, 2)]);
        let err = req.check().unwrap_err();
        assert!(err.to_string().contains("more than one constraint"));
    }

    #[test]
    fn test_instance_type_requires_reserved() {
        let mut c = instance_constraint(Uuid::new_v4(), 1);
        c.constraint_type = ConstraintType::OnDemand;
        assert!(matches!(request(vec![c]).check(), Err(AllocError::Validation(_))));
    }

    #[test]
    fn test_ip_block_length_range() {
        assert!(check_constraint_value(ResourceType::IpBlock, ConstraintType::Reserved, 24).is_ok());
        assert!(check_constraint_value(ResourceType::IpBlock, ConstraintType::Reserved, 129).is_err());
    }

    #[test]
    fn test_update_request() {
        let ok = UpdateConstraintRequest {
            constraint_id: Uuid::new_v4(),
            constraint_value: 3,
        };
        ok.check().unwrap();
        let bad = UpdateConstraintRequest {
            constraint_value: -1,
            ..ok
        };
        assert!(bad.check().is_err());
    }

    #[test]
    fn test_rename_request_checks_name_only_when_given() {
        let keep = UpdateAllocationRequest {
            allocation_id: Uuid::new_v4(),
            name: None,
            description: Some("batch jobs".into()),
        };
        keep.check().unwrap();

        let renamed = UpdateAllocationRequest {
            name: Some("pool b".into()),
            ..keep.clone()
        };
        renamed.check().unwrap();

        for bad in ["x", "pool ", "-pool", "a/b"] {
            let req = UpdateAllocationRequest {
                name: Some(bad.into()),
                ..keep.clone()
            };
            assert!(matches!(req.check(), Err(AllocError::Validation(_))), "{bad:?} accepted");
        }
    }
}
