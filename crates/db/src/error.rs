/// Errors raised by the row stores and transactions.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Applying the bundled migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Column {column} in table {table} may not be null")]
    NotNull { table: String, column: String },

    #[error("Duplicate primary key in table {table}")]
    DuplicateKey { table: String },

    /// A row could not be converted to or from its record type.
    #[error("Row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// No row matched a lookup that requires one.
    #[error("No such record in {table}")]
    NoSuchRecord { table: String },

    /// The transaction was already committed or aborted.
    #[error("Transaction already finished")]
    Finished,
}
