use crate::error::SQLError;

/// A dynamically-typed SQL parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A row returned from a SQL query: column name to value.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    /// Get a column value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a text column value by name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get an integer column value by name.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a real column value by name. Integer columns are widened.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(Value::Real(f)) => Some(*f),
            Some(Value::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get a column value by position.
    pub fn at(&self, idx: usize) -> Option<&Value> {
        self.columns.get(idx).map(|(_, v)| v)
    }
}

/// SQLStore provides a SQL execution interface backed by an embedded database.
///
/// `query`/`exec` run in autocommit mode. Units of work that must be atomic
/// go through [`SQLStore::begin`].
pub trait SQLStore: Send + Sync {
    /// Execute a query and return rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError>;

    /// Execute a statement (INSERT/UPDATE/DELETE) and return affected row count.
    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError>;

    /// Open a new transaction. Each transaction is isolated from the others.
    fn begin(&self) -> Result<Box<dyn SQLTransaction>, SQLError>;

    /// Driver name, used to pick dialect specifics ("sqlite", "postgres").
    fn driver_name(&self) -> &'static str;

    /// Quote a table or column identifier.
    fn quote_ident(&self, ident: &str) -> String {
        quote_ident(ident)
    }
}

/// A single open database transaction.
///
/// Dropping a transaction without calling `commit` rolls it back.
pub trait SQLTransaction {
    /// Execute a query inside the transaction and return rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError>;

    /// Execute a statement inside the transaction and return affected row count.
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, SQLError>;

    /// Commit and close the transaction.
    fn commit(self: Box<Self>) -> Result<(), SQLError>;

    /// Roll back and close the transaction.
    fn rollback(self: Box<Self>) -> Result<(), SQLError>;
}

/// ANSI identifier quoting: `user` → `"user"`, embedded quotes doubled.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors() {
        let row = Row {
            columns: vec![
                ("id".to_string(), Value::Integer(7)),
                ("name".to_string(), Value::Text("x".into())),
                ("rate".to_string(), Value::Real(1.5)),
            ],
        };
        assert_eq!(row.get_i64("id"), Some(7));
        assert_eq!(row.get_str("name"), Some("x"));
        assert_eq!(row.get_f64("rate"), Some(1.5));
        assert_eq!(row.get_f64("id"), Some(7.0));
        assert_eq!(row.at(1), Some(&Value::Text("x".into())));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
