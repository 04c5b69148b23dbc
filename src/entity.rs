use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Entity types that carry a registered cascade plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Ticket,
    Employee,
    Customer,
    Category,
    Status,
    Role,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Ticket,
        EntityType::Employee,
        EntityType::Customer,
        EntityType::Category,
        EntityType::Status,
        EntityType::Role,
    ];

    /// The base table holding rows of this entity type.
    pub fn table(self) -> &'static str {
        match self {
            EntityType::Ticket => "ticket",
            EntityType::Employee => "employee",
            EntityType::Customer => "customer",
            EntityType::Category => "category",
            EntityType::Status => "status",
            EntityType::Role => "role",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.table().eq_ignore_ascii_case(table))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::from_table(s.trim()).ok_or_else(|| {
            AppError::new("ENTITY/UNKNOWN", "Unknown entity type").with_context("entity", s)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(EntityType::from_table(entity.table()), Some(entity));
        }
        assert_eq!(EntityType::from_table("TICKET"), Some(EntityType::Ticket));
        assert_eq!(EntityType::from_table("attachment"), None);
    }

    #[test]
    fn parse_rejects_unknown_names() {
        let err = "widgets".parse::<EntityType>().unwrap_err();
        assert_eq!(err.code(), "ENTITY/UNKNOWN");
        assert_eq!(" role ".parse::<EntityType>().unwrap(), EntityType::Role);
    }
}
