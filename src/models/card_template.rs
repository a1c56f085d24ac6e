use chrono::{NaiveDateTime, Utc};
use diesel::deserialize::{FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::{Sqlite, SqliteValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id of the built-in `basic` template seeded by the migrations
pub const BASIC_TEMPLATE_ID: &str = "00000000-0000-4000-8000-000000000001";

/// Id of the built-in `cloze` template seeded by the migrations
pub const CLOZE_TEMPLATE_ID: &str = "00000000-0000-4000-8000-000000000002";

/// One field of a card template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    #[serde(default = "default_field_type")]
    pub field_type: String,
    #[serde(default = "default_required")]
    pub is_required: bool,
    #[serde(default)]
    pub order: i32,
}

fn default_field_type() -> String {
    "text".to_string()
}

fn default_required() -> bool {
    true
}

/// Ordered field list stored as JSON text
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct TemplateFields(pub Vec<TemplateField>);

impl FromSql<Text, Sqlite> for TemplateFields {
    fn from_sql(value: SqliteValue<'_, '_, '_>) -> diesel::deserialize::Result<Self> {
        let text = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
        Ok(TemplateFields(serde_json::from_str(&text)?))
    }
}

impl ToSql<Text, Sqlite> for TemplateFields {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(serde_json::to_string(&self.0)?);
        Ok(IsNull::No)
    }
}

/// Describes the fields and layout of a note type
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::card_templates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CardTemplate {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub fields_schema: TemplateFields,
    pub front_template: String,
    pub back_template: String,
    pub css: Option<String>,
    /// System templates are shared and read-only
    pub is_system: bool,
    pub owner_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CardTemplate {
    pub fn new(
        owner_id: String,
        name: String,
        display_name: String,
        mut fields: Vec<TemplateField>,
        front_template: String,
        back_template: String,
        css: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();
        fields.sort_by_key(|f| f.order);
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            display_name,
            fields_schema: TemplateFields(fields),
            front_template,
            back_template,
            css,
            is_system: false,
            owner_id: Some(owner_id),
            created_at: now,
            updated_at: now,
        }
    }

    /// Names of required fields missing or empty in `values`
    pub fn missing_required_fields(&self, values: &serde_json::Value) -> Vec<String> {
        self.fields_schema
            .0
            .iter()
            .filter(|field| field.is_required)
            .filter(|field| {
                values
                    .get(&field.name)
                    .and_then(|v| v.as_str())
                    .is_none_or(|v| v.trim().is_empty())
            })
            .map(|field| field.name.clone())
            .collect()
    }

    /// Whether `user_id` may read this template
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.is_system || self.owner_id.as_deref() == Some(user_id)
    }
}
