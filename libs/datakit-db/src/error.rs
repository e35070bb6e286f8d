use datakit_odata::SourceError;
use sea_orm::DbErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sea(#[from] DbErr),

    #[error("unsupported database engine '{0}'")]
    UnknownEngine(String),

    #[error("database engine '{0}' is not enabled in this build")]
    EngineDisabled(&'static str),

    #[error("invalid connection options: {0}")]
    InvalidConfig(String),

    #[error("access denied: {0}")]
    Denied(&'static str),

    #[error("tenant {tenant_id} is not in the caller's scope")]
    TenantNotInScope { tenant_id: uuid::Uuid },
}

impl From<DbError> for SourceError {
    fn from(err: DbError) -> Self {
        let message = match &err {
            DbError::Sea(_) => "database query failed".to_owned(),
            other => other.to_string(),
        };
        SourceError::with_source(message, err)
    }
}
