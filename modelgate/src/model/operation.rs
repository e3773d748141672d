use crate::error::{ModelGateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Every operation a model exposes. Keys both the allow-list and the hook map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Aggregate,
    Insert,
    InsertMany,
    Update,
    UpdateMany,
    FindMany,
    Find,
    FindById,
    Delete,
    DeleteMany,
    Total,
    BulkWrite,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::Aggregate,
        OperationKind::Insert,
        OperationKind::InsertMany,
        OperationKind::Update,
        OperationKind::UpdateMany,
        OperationKind::FindMany,
        OperationKind::Find,
        OperationKind::FindById,
        OperationKind::Delete,
        OperationKind::DeleteMany,
        OperationKind::Total,
        OperationKind::BulkWrite,
    ];

    /// Operations granted to a model defined with `validity: true`.
    pub const VALIDITY_PRESET: [OperationKind; 8] = [
        OperationKind::Delete,
        OperationKind::Find,
        OperationKind::FindById,
        OperationKind::FindMany,
        OperationKind::Insert,
        OperationKind::Total,
        OperationKind::Update,
        OperationKind::UpdateMany,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Aggregate => "aggregate",
            OperationKind::Insert => "insert",
            OperationKind::InsertMany => "insertMany",
            OperationKind::Update => "update",
            OperationKind::UpdateMany => "updateMany",
            OperationKind::FindMany => "findMany",
            OperationKind::Find => "find",
            OperationKind::FindById => "findById",
            OperationKind::Delete => "delete",
            OperationKind::DeleteMany => "deleteMany",
            OperationKind::Total => "total",
            OperationKind::BulkWrite => "bulkWrite",
        }
    }

    pub fn validity_preset() -> BTreeSet<OperationKind> {
        Self::VALIDITY_PRESET.into_iter().collect()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ModelGateError;

    fn from_str(s: &str) -> Result<Self> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                ModelGateError::Schema(format!(
                    "Unknown operation '{s}'. Expected one of: {}",
                    OperationKind::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_names_round_trip_through_str_and_serde() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.to_string())
            );
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = "upsert".parse::<OperationKind>().unwrap_err();
        assert!(err.to_string().contains("Unknown operation 'upsert'"));
        assert!("FindById".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_validity_preset() {
        let preset = OperationKind::validity_preset();
        assert_eq!(preset.len(), 8);
        for excluded in [
            OperationKind::Aggregate,
            OperationKind::BulkWrite,
            OperationKind::InsertMany,
            OperationKind::DeleteMany,
        ] {
            assert!(!preset.contains(&excluded));
        }
    }
}
