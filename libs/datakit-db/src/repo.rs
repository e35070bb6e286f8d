//! Tenant-scoped CRUD on a single entity.
//!
//! Reads and deletes carry the scope condition; writes check that the tenant
//! being written belongs to the scope before touching the database.

use std::marker::PhantomData;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DbErr,
    EntityTrait, IntoActiveModel, Iterable, ModelTrait, PrimaryKeyTrait, QueryFilter, Statement,
    TransactionTrait, TryGetable, Value,
};
use uuid::Uuid;

use crate::connect::Engine;
use crate::error::DbError;
use crate::scope::{AccessScope, ScopableEntity, build_scope_condition};

type PrimaryKeyOf<E> = <<E as EntityTrait>::PrimaryKey as PrimaryKeyTrait>::ValueType;

/// Scoped access to `E` over a connection or a transaction.
///
/// ```rust,ignore
/// let repo = Repository::<note::Entity, _>::new(db.conn(), AccessScope::for_tenant(tid));
/// let saved = repo.insert(note::ActiveModel { tenant_id: Set(tid), ..Default::default() }).await?;
/// assert!(repo.find_by_id(saved.id).await?.is_some());
/// let renamed = repo.update(note::ActiveModel { id: Set(saved.id), title: Set(t), ..Default::default() }).await?;
/// ```
#[derive(Debug)]
pub struct Repository<'c, E, C> {
    conn: &'c C,
    scope: AccessScope,
    batch_rows: Option<usize>,
    _entity: PhantomData<E>,
}

impl<'c, E, C> Repository<'c, E, C>
where
    E: ScopableEntity,
    E::Column: ColumnTrait + Copy,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
    E::Model: IntoActiveModel<E::ActiveModel> + ModelTrait<Entity = E> + Send + Sync,
    C: ConnectionTrait,
{
    #[must_use]
    pub fn new(conn: &'c C, scope: AccessScope) -> Self {
        Self {
            conn,
            scope,
            batch_rows: None,
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub fn scope(&self) -> &AccessScope {
        &self.scope
    }

    /// `None` when the row is missing or belongs to another tenant.
    ///
    /// # Errors
    /// Returns [`DbError::Sea`] when the query fails.
    pub async fn find_by_id<K>(&self, id: K) -> Result<Option<E::Model>, DbError>
    where
        K: Into<PrimaryKeyOf<E>>,
    {
        let row = E::find_by_id(id)
            .filter(build_scope_condition::<E>(&self.scope))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    /// # Errors
    /// - [`DbError::Denied`] when the scope forbids writes or the tenant is unset
    /// - [`DbError::TenantNotInScope`] when the row's tenant is outside the scope
    /// - [`DbError::Sea`] when the insert fails
    pub async fn insert(&self, am: E::ActiveModel) -> Result<E::Model, DbError> {
        self.check_write(&am, true)?;
        Ok(am.insert(self.conn).await?)
    }

    /// Update the row named by the primary key carried in `am`.
    ///
    /// The statement itself is restricted to the scope, so a key outside it
    /// matches nothing. A tenant value in `am` must equal the stored one.
    ///
    /// # Errors
    /// - [`DbError::Denied`] when the key is unset, or no row in scope has
    ///   that key and tenant
    /// - [`DbError::TenantNotInScope`] when `am` names a tenant outside the scope
    /// - [`DbError::Sea`] when the update fails
    pub async fn update(&self, am: E::ActiveModel) -> Result<E::Model, DbError> {
        if am.get_primary_key_value().is_none() {
            return Err(DbError::Denied("primary key is required"));
        }
        self.check_write(&am, false)?;

        let mut cond = build_scope_condition::<E>(&self.scope);
        if let Some(col) = E::tenant_col()
            && let Some(incoming) = tenant_of(&am, col)?
        {
            cond = cond.add(col.eq(incoming));
        }
        match E::update(am).filter(cond).exec(self.conn).await {
            Ok(model) => Ok(model),
            Err(DbErr::RecordNotUpdated) => Err(DbError::Denied("row not found in scope")),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether a row was deleted.
    ///
    /// # Errors
    /// Returns [`DbError::Sea`] when the delete fails.
    pub async fn delete_by_id<K>(&self, id: K) -> Result<bool, DbError>
    where
        K: Into<PrimaryKeyOf<E>>,
    {
        let res = E::delete_by_id(id)
            .filter(build_scope_condition::<E>(&self.scope))
            .exec(self.conn)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Rows per `INSERT` in [`bulk_insert`](Self::bulk_insert). Defaults to
    /// as many as the engine's bind-parameter limit allows.
    #[must_use]
    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = Some(rows.max(1));
        self
    }

    /// Insert many rows in one transaction, split into statements that stay
    /// under the engine's bind-parameter limit. Returns the number of rows
    /// inserted.
    ///
    /// # Errors
    /// Same as [`insert`](Self::insert). Nothing is written if any row fails
    /// the scope check or any statement fails.
    pub async fn bulk_insert(&self, models: Vec<E::ActiveModel>) -> Result<u64, DbError>
    where
        C: TransactionTrait,
    {
        for am in &models {
            self.check_write(am, true)?;
        }
        if models.is_empty() {
            return Ok(0);
        }
        let engine = Engine::from(self.conn.get_database_backend());
        let per_chunk = self.batch_rows.unwrap_or_else(|| {
            rows_per_statement(engine.max_bind_params(), E::Column::iter().count())
        });

        let txn = self.conn.begin().await?;
        let mut rows = models.into_iter();
        let mut inserted = 0;
        let mut statements = 0_u32;
        loop {
            let chunk: Vec<E::ActiveModel> = rows.by_ref().take(per_chunk).collect();
            if chunk.is_empty() {
                break;
            }
            inserted += E::insert_many(chunk).exec_without_returning(&txn).await?;
            statements += 1;
        }
        txn.commit().await?;
        tracing::debug!(engine = engine.name(), inserted, per_chunk, statements, "bulk insert");
        Ok(inserted)
    }

    /// First column of the first row of a raw statement.
    ///
    /// Raw SQL bypasses the scope; callers add their own tenant predicate.
    ///
    /// # Errors
    /// Returns [`DbError::Sea`] when the statement fails or the column cannot
    /// be read as `T`.
    pub async fn scalar<T: TryGetable>(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Option<T>, DbError> {
        let stmt = Statement::from_sql_and_values(self.conn.get_database_backend(), sql, values);
        let Some(row) = self.conn.query_one(stmt).await? else {
            return Ok(None);
        };
        Ok(Some(row.try_get_by_index::<T>(0)?))
    }

    fn check_write(&self, am: &E::ActiveModel, require_tenant: bool) -> Result<(), DbError> {
        if self.scope.is_deny_all() {
            return Err(DbError::Denied("scope denies all writes"));
        }
        if self.scope.is_unconstrained() || E::IS_UNRESTRICTED {
            return Ok(());
        }
        let Some(col) = E::tenant_col() else {
            return Err(DbError::Denied("entity has no tenant column"));
        };
        match tenant_of(am, col)? {
            Some(tenant_id) if self.scope.contains_tenant(tenant_id) => Ok(()),
            Some(tenant_id) => Err(DbError::TenantNotInScope { tenant_id }),
            None if require_tenant => Err(DbError::Denied("tenant_id is required")),
            None => Ok(()),
        }
    }
}

/// Rows that fit in one statement when each row binds `columns` values.
fn rows_per_statement(max_bind_params: usize, columns: usize) -> usize {
    max_bind_params
        .checked_div(columns)
        .unwrap_or(max_bind_params)
        .max(1)
}

fn tenant_of<A, C>(am: &A, col: C) -> Result<Option<Uuid>, DbError>
where
    A: ActiveModelTrait,
    C: Into<<A::Entity as EntityTrait>::Column>,
{
    match am.get(col.into()) {
        ActiveValue::Set(v) | ActiveValue::Unchanged(v) => match uuid_value(v) {
            Some(id) => Ok(Some(id)),
            None => Err(DbError::Denied("tenant_id must be a non-null uuid")),
        },
        ActiveValue::NotSet => Ok(None),
    }
}

fn uuid_value(v: Value) -> Option<Uuid> {
    match v {
        Value::Uuid(Some(u)) => Some(*u),
        _ => None,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn statements_stay_under_the_bind_limit() {
        assert_eq!(rows_per_statement(32_766, 4), 8_191);
        assert_eq!(rows_per_statement(65_535, 7), 9_362);
        assert_eq!(rows_per_statement(10, 0), 10);
        assert_eq!(rows_per_statement(3, 8), 1);
    }

    #[test]
    fn only_uuid_values_are_tenants() {
        let id = Uuid::nil();
        assert_eq!(uuid_value(Value::from(id)), Some(id));
        assert_eq!(uuid_value(Value::Uuid(None)), None);
        assert_eq!(uuid_value(Value::from("x")), None);
    }
}
