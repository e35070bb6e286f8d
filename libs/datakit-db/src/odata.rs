//! `SeaORM` implementation of the query-shaping seam.
//!
//! ```rust,ignore
//! let fields: FieldMap<user::Entity> = FieldMap::new()
//!     .insert("name", user::Column::Name, FieldKind::String)
//!     .insert("age", user::Column::Age, FieldKind::I64);
//!
//! let base = scoped_query::<user::Entity>(&scope, Arc::new(fields));
//! let page = QueryPipeline::new(&policy)
//!     .execute(base, &SeaExecutor::new(db.conn()), request)
//!     .await?;
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::ToPrimitive;
use chrono::{DateTime, NaiveDate, Utc};
use datakit_odata::{
    CompareOp, FilterExpr, FilterValue, OrderKey, QueryExecutor, ShapeError, ShapeableQuery,
    SortDir, SourceError, StringFunction,
};
use sea_orm::sea_query::SimpleExpr;
use serde_json::Value as JsonValue;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, Order, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Select, Value,
};
use uuid::Uuid;

use crate::error::DbError;
use crate::scope::{AccessScope, ScopableEntity, build_scope_condition};

/// Storage type of an exposed field; drives literal coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    I64,
    F64,
    Bool,
    Uuid,
    DateTimeUtc,
    Date,
}

/// Wire field names an entity exposes, and the columns behind them.
///
/// Only mapped names can be filtered, sorted or selected, and only mapped
/// names appear in fetched items.
#[derive(Clone)]
pub struct FieldMap<E: EntityTrait> {
    fields: HashMap<String, (E::Column, FieldKind)>,
}

impl<E: EntityTrait> Default for FieldMap<E> {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }
}

impl<E: EntityTrait> std::fmt::Debug for FieldMap<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FieldMap").field("fields", &names).finish()
    }
}

impl<E: EntityTrait> FieldMap<E>
where
    E::Column: ColumnTrait + Copy,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn insert(mut self, name: impl Into<String>, col: E::Column, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), (col, kind));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<(E::Column, FieldKind)> {
        self.fields.get(name).copied()
    }

    /// Mapped names in a stable order.
    fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&self, name: &str) -> Result<(E::Column, FieldKind), ShapeError> {
        self.get(name)
            .ok_or_else(|| ShapeError::UnknownField(name.to_owned()))
    }

    /// Lower a filter tree into a `SeaORM` condition.
    ///
    /// # Errors
    /// Returns [`ShapeError`] for unmapped fields, literals that do not match
    /// the field's kind, and string functions on non-string fields.
    pub fn condition(&self, expr: &FilterExpr) -> Result<Condition, ShapeError> {
        match expr {
            FilterExpr::And(l, r) => Ok(Condition::all()
                .add(self.condition(l)?)
                .add(self.condition(r)?)),
            FilterExpr::Or(l, r) => Ok(Condition::any()
                .add(self.condition(l)?)
                .add(self.condition(r)?)),
            FilterExpr::Not(inner) => Ok(self.condition(inner)?.not()),
            FilterExpr::Compare { field, op, value } => {
                let (col, kind) = self.resolve(field)?;
                compare(col, kind, field, *op, value).map(|e| Condition::all().add(e))
            }
            FilterExpr::In { field, values } => {
                let (col, kind) = self.resolve(field)?;
                let values = values
                    .iter()
                    .map(|v| coerce(kind, field, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Condition::all().add(col.is_in(values)))
            }
            FilterExpr::Function { func, field, value } => {
                let (col, kind) = self.resolve(field)?;
                if kind != FieldKind::String {
                    return Err(ShapeError::Unsupported {
                        field: field.clone(),
                        what: func.as_str().to_owned(),
                    });
                }
                let expr = match func {
                    StringFunction::Contains => col.contains(value.as_str()),
                    StringFunction::StartsWith => col.starts_with(value.as_str()),
                    StringFunction::EndsWith => col.ends_with(value.as_str()),
                };
                Ok(Condition::all().add(expr))
            }
        }
    }
}

fn compare<C: ColumnTrait>(
    col: C,
    kind: FieldKind,
    field: &str,
    op: CompareOp,
    value: &FilterValue,
) -> Result<SimpleExpr, ShapeError> {
    if value.is_null() {
        return match op {
            CompareOp::Eq => Ok(col.is_null()),
            CompareOp::Ne => Ok(col.is_not_null()),
            _ => Err(mismatch(field, "null can only be compared with eq or ne")),
        };
    }
    let v = coerce(kind, field, value)?;
    Ok(match op {
        CompareOp::Eq => col.eq(v),
        CompareOp::Ne => col.ne(v),
        CompareOp::Gt => col.gt(v),
        CompareOp::Ge => col.gte(v),
        CompareOp::Lt => col.lt(v),
        CompareOp::Le => col.lte(v),
    })
}

/// Convert a literal into the column's value type.
fn coerce(kind: FieldKind, field: &str, value: &FilterValue) -> Result<Value, ShapeError> {
    let bad = || mismatch(field, &format!("{value} is not a valid {kind:?}"));
    match (kind, value) {
        (FieldKind::String, FilterValue::String(s)) => Ok(Value::from(s.clone())),
        (FieldKind::I64, FilterValue::Number(n)) => n.to_i64().map(Value::from).ok_or_else(bad),
        (FieldKind::F64, FilterValue::Number(n)) => n.to_f64().map(Value::from).ok_or_else(bad),
        (FieldKind::Bool, FilterValue::Bool(b)) => Ok(Value::from(*b)),
        (FieldKind::Uuid, FilterValue::Uuid(u)) => Ok(Value::from(*u)),
        (FieldKind::Uuid, FilterValue::String(s)) => {
            Uuid::parse_str(s).map(Value::from).map_err(|_| bad())
        }
        (FieldKind::DateTimeUtc, FilterValue::DateTime(dt)) => Ok(Value::from(*dt)),
        (FieldKind::DateTimeUtc, FilterValue::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::from(dt.with_timezone(&Utc)))
            .map_err(|_| bad()),
        (FieldKind::Date, FilterValue::Date(d)) => Ok(Value::from(*d)),
        (FieldKind::Date, FilterValue::String(s)) => {
            NaiveDate::from_str(s).map(Value::from).map_err(|_| bad())
        }
        _ => Err(bad()),
    }
}

fn mismatch(field: &str, detail: &str) -> ShapeError {
    ShapeError::TypeMismatch {
        field: field.to_owned(),
        detail: detail.to_owned(),
    }
}

/// A `SeaORM` select plus the field mapping it is shaped through.
///
/// Navigation includes are not supported; `$expand` is refused at shaping
/// time.
#[derive(Debug, Clone)]
pub struct SeaQuery<E: EntityTrait> {
    select: Select<E>,
    fields: Arc<FieldMap<E>>,
    projection: Vec<String>,
}

impl<E: EntityTrait> SeaQuery<E>
where
    E::Column: ColumnTrait + Copy,
{
    /// Wrap an existing select. Its conditions stay in force.
    #[must_use]
    pub fn new(select: Select<E>, fields: Arc<FieldMap<E>>) -> Self {
        Self {
            select,
            fields,
            projection: Vec::new(),
        }
    }

    /// Field names requested by `$select`.
    #[must_use]
    pub fn projection(&self) -> &[String] {
        &self.projection
    }

    #[must_use]
    pub fn into_select(self) -> Select<E> {
        self.select
    }

    /// The select as fetched: only the projected fields, or every mapped
    /// field when there is no projection, each aliased to its wire name.
    #[must_use]
    pub fn into_projected_select(self) -> Select<E> {
        let names: Vec<&str> = if self.projection.is_empty() {
            self.fields.names()
        } else {
            self.projection.iter().map(String::as_str).collect()
        };
        let mut select = self.select.select_only();
        for name in names {
            if let Some((col, _)) = self.fields.get(name) {
                select = select.column_as(col, name);
            }
        }
        select
    }
}

/// Base query for `E` restricted to `scope`.
#[must_use]
pub fn scoped_query<E>(scope: &AccessScope, fields: Arc<FieldMap<E>>) -> SeaQuery<E>
where
    E: ScopableEntity,
    E::Column: ColumnTrait + Copy,
{
    let select = E::find().filter(build_scope_condition::<E>(scope));
    SeaQuery::new(select, fields)
}

impl<E> ShapeableQuery for SeaQuery<E>
where
    E: EntityTrait,
    E::Column: ColumnTrait + Copy,
{
    fn and_filter(mut self, filter: &FilterExpr) -> Result<Self, ShapeError> {
        let cond = self.fields.condition(filter)?;
        self.select = self.select.filter(cond);
        Ok(self)
    }

    fn order_by(mut self, keys: &[OrderKey]) -> Result<Self, ShapeError> {
        for key in keys {
            let (col, _) = self.fields.resolve(&key.field)?;
            let order = match key.dir {
                SortDir::Asc => Order::Asc,
                SortDir::Desc => Order::Desc,
            };
            self.select = self.select.order_by(col, order);
        }
        Ok(self)
    }

    fn skip(mut self, n: u64) -> Self {
        self.select = self.select.offset(n);
        self
    }

    fn take(mut self, n: u64) -> Self {
        self.select = self.select.limit(n);
        self
    }

    fn include(self, path: &str) -> Result<Self, ShapeError> {
        Err(ShapeError::Unsupported {
            field: path.to_owned(),
            what: "$expand".to_owned(),
        })
    }

    fn select(mut self, fields: &[String]) -> Result<Self, ShapeError> {
        for name in fields {
            self.fields.resolve(name)?;
        }
        self.projection = fields.to_vec();
        Ok(self)
    }
}

/// Runs [`SeaQuery`] values on a connection or an open transaction.
///
/// Items are JSON objects keyed by wire field name.
#[derive(Debug, Clone, Copy)]
pub struct SeaExecutor<'c, C> {
    conn: &'c C,
}

impl<'c, C: ConnectionTrait> SeaExecutor<'c, C> {
    #[must_use]
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'c, E, C> QueryExecutor<SeaQuery<E>> for SeaExecutor<'c, C>
where
    E: EntityTrait,
    E::Column: ColumnTrait + Copy,
    E::Model: Sync,
    C: ConnectionTrait + Send + Sync,
{
    type Item = JsonValue;

    async fn count(&self, query: &SeaQuery<E>) -> Result<u64, SourceError> {
        let n = query
            .select
            .clone()
            .count(self.conn)
            .await
            .map_err(DbError::from)?;
        Ok(n)
    }

    async fn fetch(&self, query: SeaQuery<E>) -> Result<Vec<JsonValue>, SourceError> {
        let rows = query
            .into_projected_select()
            .into_json()
            .all(self.conn)
            .await
            .map_err(DbError::from)?;
        Ok(rows)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use sea_orm::{DbBackend, QueryTrait};

    mod person {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "people")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i64,
            pub tenant_id: Uuid,
            pub name: String,
            pub score: f64,
            pub active: bool,
            pub born: Date,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    impl ScopableEntity for person::Entity {
        fn tenant_col() -> Option<person::Column> {
            Some(person::Column::TenantId)
        }
    }

    fn fields() -> Arc<FieldMap<person::Entity>> {
        Arc::new(
            FieldMap::new()
                .insert("id", person::Column::Id, FieldKind::I64)
                .insert("name", person::Column::Name, FieldKind::String)
                .insert("score", person::Column::Score, FieldKind::F64)
                .insert("active", person::Column::Active, FieldKind::Bool)
                .insert("born", person::Column::Born, FieldKind::Date),
        )
    }

    fn sql(q: SeaQuery<person::Entity>) -> String {
        q.into_select().build(DbBackend::Sqlite).to_string()
    }

    #[test]
    fn client_filter_is_anded_with_the_scope() {
        let tid = Uuid::new_v4();
        let base = scoped_query::<person::Entity>(&AccessScope::for_tenant(tid), fields());
        let filter = FilterExpr::eq("name", "ann").or(FilterExpr::eq("id", 1_i64));

        let sql = sql(base.and_filter(&filter).unwrap());

        assert!(sql.contains(r#""people"."tenant_id" IN"#), "{sql}");
        assert!(sql.contains(r#""people"."name" = 'ann' OR "people"."id" = 1"#), "{sql}");
        assert!(sql.contains(" AND "), "{sql}");
    }

    #[test]
    fn ordering_and_paging_render() {
        let q = SeaQuery::new(person::Entity::find(), fields())
            .order_by(&[OrderKey::desc("score"), OrderKey::asc("name")])
            .unwrap()
            .skip(20)
            .take(10);
        let sql = sql(q);
        assert!(
            sql.contains(r#"ORDER BY "people"."score" DESC, "people"."name" ASC"#),
            "{sql}"
        );
        assert!(sql.contains("LIMIT 10 OFFSET 20"), "{sql}");
    }

    #[test]
    fn unmapped_fields_are_shape_errors() {
        let q = SeaQuery::new(person::Entity::find(), fields());
        assert_eq!(
            q.clone()
                .and_filter(&FilterExpr::eq("tenant_id", "x"))
                .unwrap_err(),
            ShapeError::UnknownField("tenant_id".to_owned())
        );
        assert!(q.clone().order_by(&[OrderKey::asc("salary")]).is_err());
        assert!(q.select(&["nope".to_owned()]).is_err());
    }

    #[test]
    fn literals_must_match_the_field_kind() {
        let q = SeaQuery::new(person::Entity::find(), fields());
        let err = q
            .clone()
            .and_filter(&FilterExpr::eq("id", "seven"))
            .unwrap_err();
        assert!(matches!(err, ShapeError::TypeMismatch { field, .. } if field == "id"));

        let err = q
            .clone()
            .and_filter(&FilterExpr::Function {
                func: StringFunction::Contains,
                field: "score".to_owned(),
                value: "1".to_owned(),
            })
            .unwrap_err();
        assert!(matches!(err, ShapeError::Unsupported { .. }));

        let born = FilterExpr::compare("born", CompareOp::Ge, "2000-01-01");
        assert!(q.and_filter(&born).is_ok());
    }

    #[test]
    fn null_comparisons_become_is_null() {
        let q = SeaQuery::new(person::Entity::find(), fields())
            .and_filter(&FilterExpr::eq("name", FilterValue::Null).not())
            .unwrap();
        let sql = sql(q);
        assert!(sql.contains("IS NULL"), "{sql}");
        assert!(sql.contains("NOT"), "{sql}");
    }

    #[test]
    fn expand_is_refused() {
        let err = SeaQuery::new(person::Entity::find(), fields())
            .include("Friends")
            .unwrap_err();
        assert!(matches!(
            err,
            ShapeError::Unsupported { ref field, ref what } if field == "Friends" && what == "$expand"
        ));
    }

    #[test]
    fn projection_limits_the_fetched_columns() {
        let q = SeaQuery::new(person::Entity::find(), fields())
            .select(&["name".to_owned(), "id".to_owned()])
            .unwrap();
        assert_eq!(q.projection(), ["name", "id"]);

        let sql = q.into_projected_select().build(DbBackend::Sqlite).to_string();
        assert!(sql.contains(r#""people"."name" AS "name""#), "{sql}");
        assert!(sql.contains(r#""people"."id" AS "id""#), "{sql}");
        assert!(!sql.contains("born"), "{sql}");
        assert!(!sql.contains("tenant_id"), "{sql}");
    }

    #[test]
    fn without_projection_every_mapped_field_is_fetched() {
        let sql = SeaQuery::new(person::Entity::find(), fields())
            .into_projected_select()
            .build(DbBackend::Sqlite)
            .to_string();
        for name in ["active", "born", "id", "name", "score"] {
            assert!(sql.contains(&format!(r#"AS "{name}""#)), "{sql}");
        }
        assert!(!sql.contains("tenant_id"), "{sql}");
    }
}
