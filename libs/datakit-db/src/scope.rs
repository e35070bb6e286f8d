//! Tenant scoping of base queries.
//!
//! Every query the crate builds starts from an [`AccessScope`]. The scope
//! condition is part of the base query; client filters are ANDed onto it and
//! can never remove it.

use std::collections::BTreeSet;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Condition, EntityTrait};
use uuid::Uuid;

/// Which tenants' rows a caller may see.
///
/// The default scope denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessScope {
    kind: ScopeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ScopeKind {
    #[default]
    DenyAll,
    AllowAll,
    Tenants(BTreeSet<Uuid>),
}

impl AccessScope {
    #[must_use]
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// No tenant restriction. For system callers only.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            kind: ScopeKind::AllowAll,
        }
    }

    #[must_use]
    pub fn for_tenant(id: Uuid) -> Self {
        Self::for_tenants([id])
    }

    /// An empty set yields a deny-all scope.
    #[must_use]
    pub fn for_tenants<I: IntoIterator<Item = Uuid>>(ids: I) -> Self {
        let ids: BTreeSet<Uuid> = ids.into_iter().collect();
        if ids.is_empty() {
            Self::deny_all()
        } else {
            Self {
                kind: ScopeKind::Tenants(ids),
            }
        }
    }

    #[must_use]
    pub fn is_deny_all(&self) -> bool {
        matches!(self.kind, ScopeKind::DenyAll)
    }

    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        matches!(self.kind, ScopeKind::AllowAll)
    }

    #[must_use]
    pub fn contains_tenant(&self, id: Uuid) -> bool {
        match &self.kind {
            ScopeKind::AllowAll => true,
            ScopeKind::DenyAll => false,
            ScopeKind::Tenants(ids) => ids.contains(&id),
        }
    }
}

/// An entity that declares where its tenant lives.
///
/// ```rust,ignore
/// impl ScopableEntity for user::Entity {
///     fn tenant_col() -> Option<Self::Column> {
///         Some(user::Column::TenantId)
///     }
/// }
/// ```
pub trait ScopableEntity: EntityTrait {
    /// Global tables (lookups, settings) opt out of tenant filtering.
    const IS_UNRESTRICTED: bool = false;

    fn tenant_col() -> Option<Self::Column>;
}

fn deny_all() -> Condition {
    Condition::all().add(Expr::value(false))
}

/// SQL condition equivalent to `scope` for entity `E`.
///
/// | Scope | Condition |
/// |-------|-----------|
/// | deny-all | `WHERE false` |
/// | allow-all | none |
/// | tenants, entity has a tenant column | `tenant_col IN (...)` |
/// | tenants, unrestricted entity | none |
/// | tenants, entity without tenant column | `WHERE false` |
#[must_use]
pub fn build_scope_condition<E>(scope: &AccessScope) -> Condition
where
    E: ScopableEntity,
    E::Column: ColumnTrait + Copy,
{
    match &scope.kind {
        ScopeKind::DenyAll => deny_all(),
        ScopeKind::AllowAll => Condition::all(),
        ScopeKind::Tenants(_) if E::IS_UNRESTRICTED => Condition::all(),
        ScopeKind::Tenants(ids) => match E::tenant_col() {
            Some(col) => Condition::all().add(col.is_in(ids.iter().copied())),
            None => deny_all(),
        },
    }
}
