//! Entity identity - identifier values and the keys of the identity registry
//!
//! Supports integer, UUID, text, and composite identifiers. Keys are
//! immutable and hashable: two equal keys always denote the same row.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LoadError, LoadResult};
use crate::value::DatabaseValue;

/// Identifier value of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    /// Integer identifier
    Integer(i64),
    /// UUID identifier
    Uuid(Uuid),
    /// Natural text identifier
    Text(String),
    /// Composite identifier, one part per identifier column
    Composite(Vec<Identifier>),
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Integer(id) => write!(f, "{}", id),
            Identifier::Uuid(id) => write!(f, "{}", id),
            Identifier::Text(id) => write!(f, "{}", id),
            Identifier::Composite(parts) => {
                let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(","))
            }
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Integer(value)
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Identifier::Integer(value as i64)
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Identifier::Uuid(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Text(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Text(value)
    }
}

impl Identifier {
    /// Convert a single column value into an identifier part
    pub fn from_value(value: &DatabaseValue) -> LoadResult<Option<Identifier>> {
        match value {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::Int32(i) => Ok(Some(Identifier::Integer(*i as i64))),
            DatabaseValue::Int64(i) => Ok(Some(Identifier::Integer(*i))),
            DatabaseValue::Uuid(u) => Ok(Some(Identifier::Uuid(*u))),
            DatabaseValue::String(s) => Ok(Some(Identifier::Text(s.clone()))),
            other => Err(LoadError::InvalidIdentifier(format!(
                "{} values cannot be used as identifiers",
                other.type_name()
            ))),
        }
    }

    /// Build an identifier from the values of all identifier columns.
    ///
    /// All-null columns mean "no row" (outer join miss). A composite key that
    /// is only partially null is rejected.
    pub fn from_values(values: &[DatabaseValue]) -> LoadResult<Option<Identifier>> {
        match values {
            [] => Err(LoadError::InvalidIdentifier(
                "no identifier columns to read".to_string(),
            )),
            [single] => Identifier::from_value(single),
            many => {
                let nulls = many.iter().filter(|v| v.is_null()).count();
                if nulls == many.len() {
                    return Ok(None);
                }
                if nulls > 0 {
                    return Err(LoadError::InvalidIdentifier(format!(
                        "composite identifier has {} null part(s) out of {}",
                        nulls,
                        many.len()
                    )));
                }
                let mut parts = Vec::with_capacity(many.len());
                for value in many {
                    if let Some(part) = Identifier::from_value(value)? {
                        parts.push(part);
                    }
                }
                Ok(Some(Identifier::Composite(parts)))
            }
        }
    }

    /// Column values for binding, checked against the expected column count
    pub fn to_values(&self, width: usize) -> LoadResult<Vec<DatabaseValue>> {
        let values: Vec<DatabaseValue> = match self {
            Identifier::Composite(parts) => parts.iter().map(Identifier::to_value).collect(),
            single => vec![single.to_value()],
        };
        if values.len() != width {
            return Err(LoadError::InvalidIdentifier(format!(
                "identifier {} has {} part(s), expected {}",
                self,
                values.len(),
                width
            )));
        }
        Ok(values)
    }

    fn to_value(&self) -> DatabaseValue {
        match self {
            Identifier::Integer(i) => DatabaseValue::Int64(*i),
            Identifier::Uuid(u) => DatabaseValue::Uuid(*u),
            Identifier::Text(s) => DatabaseValue::String(s.clone()),
            Identifier::Composite(parts) => {
                DatabaseValue::Array(parts.iter().map(Identifier::to_value).collect())
            }
        }
    }
}

/// Key of one managed row: entity name, identifier and optional tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity: String,
    id: Identifier,
    tenant: Option<String>,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
            tenant: None,
        }
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Same identifier and tenant under another entity name (shared primary keys)
    pub fn retarget(&self, entity: &str) -> EntityKey {
        EntityKey {
            entity: entity.to_string(),
            id: self.id.clone(),
            tenant: self.tenant.clone(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tenant {
            Some(tenant) => write!(f, "{}#{}@{}", self.entity, self.id, tenant),
            None => write!(f, "{}#{}", self.entity, self.id),
        }
    }
}

/// Key of the unique-property index: one value of a declared unique property
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    pub entity: String,
    pub property: String,
    pub value: Identifier,
    pub tenant: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_from_values() {
        assert_eq!(
            Identifier::from_values(&[DatabaseValue::Int32(7)]).unwrap(),
            Some(Identifier::Integer(7))
        );
        assert_eq!(Identifier::from_values(&[DatabaseValue::Null]).unwrap(), None);

        let composite = Identifier::from_values(&[
            DatabaseValue::Int64(1),
            DatabaseValue::String("eu".into()),
        ])
        .unwrap();
        assert_eq!(
            composite,
            Some(Identifier::Composite(vec![
                Identifier::Integer(1),
                Identifier::Text("eu".into())
            ]))
        );

        assert_eq!(
            Identifier::from_values(&[DatabaseValue::Null, DatabaseValue::Null]).unwrap(),
            None
        );
        assert!(Identifier::from_values(&[DatabaseValue::Int64(1), DatabaseValue::Null]).is_err());
        assert!(Identifier::from_values(&[DatabaseValue::Bool(true)]).is_err());
    }

    #[test]
    fn test_to_values_checks_width() {
        let id = Identifier::Composite(vec![1i64.into(), "eu".into()]);
        assert_eq!(
            id.to_values(2).unwrap(),
            vec![DatabaseValue::Int64(1), DatabaseValue::String("eu".into())]
        );
        assert!(id.to_values(1).is_err());
        assert_eq!(
            Identifier::Integer(4).to_values(1).unwrap(),
            vec![DatabaseValue::Int64(4)]
        );
    }

    #[test]
    fn test_entity_key_display_and_equality() {
        let key = EntityKey::new("Order", 7i64);
        assert_eq!(key.to_string(), "Order#7");
        assert_eq!(key, EntityKey::new("Order", Identifier::Integer(7)));
        assert_ne!(key, EntityKey::new("Invoice", 7i64));

        let tenant_key = key.clone().with_tenant(Some("acme".into()));
        assert_eq!(tenant_key.to_string(), "Order#7@acme");
        assert_ne!(key, tenant_key);
        assert_eq!(tenant_key.retarget("OrderDetail").to_string(), "OrderDetail#7@acme");
    }
}
