//! Table definitions.
//!
//! Tables describe their columns precisely enough for the stores to
//! validate rows and for [`Table::create_sql`] to emit DDL.

use crate::error::DbError;

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Auto-assigned `BIGSERIAL` identifier.
    Serial,
    BigInt,
    Integer,
    Text,
    Boolean,
    /// `TIMESTAMPTZ`, carried as RFC 3339 text in rows.
    Timestamp,
    Json,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Serial => "BIGSERIAL",
            ColumnKind::BigInt => "BIGINT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Text => "TEXT",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::Json => "JSONB",
        }
    }
}

/// Value a column takes when an insert omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    /// Insert time.
    Now,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            default: None,
        }
    }

    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Serial)
    }

    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::BigInt)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Timestamp)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Json)
    }

    /// Allow `NULL` values.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Default to the insert time when omitted.
    pub fn default_now(mut self) -> Self {
        self.default = Some(ColumnDefault::Now);
        self
    }

    /// Whether an insert may omit this column.
    pub fn has_default(&self) -> bool {
        self.kind == ColumnKind::Serial || self.default.is_some() || self.nullable
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.kind.sql_type());
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if self.default == Some(ColumnDefault::Now) {
            def.push_str(" DEFAULT NOW()");
        }
        def
    }
}

/// A table definition: name, columns, and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Append a column definition.
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the primary key columns.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Return the column or an [`DbError::UnknownColumn`].
    pub fn require_column(&self, name: &str) -> Result<&Column, DbError> {
        self.column(name).ok_or_else(|| DbError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this table.
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(Column::definition).collect();
        if !self.primary_key.is_empty() {
            let keys: Vec<String> = self.primary_key.iter().map(|k| quote_ident(k)).collect();
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            parts.join(", ")
        )
    }
}

/// Double-quote an SQL identifier, escaping embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
