use diesel::deserialize::{FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize;
use diesel::serialize::{IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::{Sqlite, SqliteValue};
use serde::{Deserialize, Serialize};

/// Stores the wrapped value as JSON text in a TEXT column
macro_rules! json_text_column {
    ($name:ident) => {
        impl FromSql<Text, Sqlite> for $name {
            fn from_sql(value: SqliteValue<'_, '_, '_>) -> diesel::deserialize::Result<Self> {
                let text = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
                Ok($name(serde_json::from_str(&text)?))
            }
        }

        impl ToSql<Text, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(serde_json::to_string(&self.0)?);
                Ok(IsNull::No)
            }
        }
    };
}

/// Represents a free-form JSON value in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct JsonValue(pub serde_json::Value);

json_text_column!(JsonValue);

impl JsonValue {
    /// An empty JSON object
    pub fn empty_object() -> Self {
        JsonValue(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Returns the string stored under `key`, if the value is an object holding a string there
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(value: serde_json::Value) -> Self {
        JsonValue(value)
    }
}

/// A list of strings stored as a JSON array (tags, languages, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct StringList(pub Vec<String>);

json_text_column!(StringList);

impl StringList {
    /// Whether any entry of `self` also appears in `other`
    pub fn overlaps(&self, other: &[String]) -> bool {
        self.0.iter().any(|tag| other.contains(tag))
    }
}

impl From<Vec<String>> for StringList {
    fn from(value: Vec<String>) -> Self {
        StringList(value)
    }
}

/// An embedding vector stored as a JSON array of floats
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct Vector(pub Vec<f32>);

json_text_column!(Vector);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_list_overlap() {
        let tags = StringList(vec!["rust".into(), "async".into()]);
        assert!(tags.overlaps(&["async".to_string()]));
        assert!(!tags.overlaps(&["python".to_string()]));
        assert!(!StringList::default().overlaps(&["rust".to_string()]));
    }

    #[test]
    fn test_transparent_serialization() {
        let tags = StringList(vec!["a".into()]);
        assert_eq!(serde_json::to_string(&tags).unwrap(), r#"["a"]"#);

        let value = JsonValue(serde_json::json!({"Front": "Q"}));
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"Front":"Q"}"#);
        assert_eq!(value.get_str("Front"), Some("Q"));
        assert_eq!(value.get_str("Back"), None);
    }
}
