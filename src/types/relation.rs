use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Stored in a relation column whose contents were never loaded.
pub const UNFETCHED: &str = ":unfetched";

/// State of a lazily loaded relation attribute.
///
/// `Loaded(vec![])` ("fetched, nothing there") is distinct from `Unfetched`
/// ("never asked"). Loaded relations are stored as a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation<T> {
    Unfetched,
    Loaded(Vec<T>),
}

impl<T> Default for Relation<T> {
    fn default() -> Self {
        Relation::Unfetched
    }
}

impl<T> Relation<T> {
    #[must_use]
    pub fn is_fetched(&self) -> bool {
        matches!(self, Relation::Loaded(_))
    }

    #[must_use]
    pub fn items(&self) -> Option<&[T]> {
        match self {
            Relation::Unfetched => None,
            Relation::Loaded(items) => Some(items),
        }
    }
}

impl<T: Serialize> Relation<T> {
    pub fn encode(&self) -> serde_json::Result<String> {
        match self {
            Relation::Unfetched => Ok(UNFETCHED.to_string()),
            Relation::Loaded(items) => serde_json::to_string(items),
        }
    }
}

impl<T: DeserializeOwned> Relation<T> {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        if raw == UNFETCHED {
            return Ok(Relation::Unfetched);
        }
        serde_json::from_str(raw).map(Relation::Loaded)
    }
}

impl<T: Serialize> ToSql for Relation<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let encoded = self
            .encode()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(encoded))
    }
}

impl<T: DeserializeOwned> FromSql for Relation<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Relation::decode(raw).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfetched_and_empty_are_distinct() {
        let unfetched: Relation<String> = Relation::Unfetched;
        let empty: Relation<String> = Relation::Loaded(vec![]);

        assert_eq!(unfetched.encode().unwrap(), ":unfetched");
        assert_eq!(empty.encode().unwrap(), "[]");
        assert_eq!(Relation::<String>::decode("[]").unwrap(), empty);
        assert_eq!(Relation::<String>::decode(":unfetched").unwrap(), unfetched);
        assert!(!unfetched.is_fetched());
        assert_eq!(empty.items(), Some(&[][..]));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Relation::<String>::decode("unfetched").is_err());
        assert!(Relation::<String>::decode("").is_err());
    }

    #[test]
    fn test_null_column_is_not_a_relation() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let result: rusqlite::Result<Relation<String>> =
            conn.query_row("SELECT NULL", [], |row| row.get(0));
        assert!(result.is_err());

        let loaded: Relation<String> = conn
            .query_row("SELECT '[\"a\",\"b\"]'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(loaded, Relation::Loaded(vec!["a".to_string(), "b".to_string()]));
    }
}
