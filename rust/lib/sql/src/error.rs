use thiserror::Error;

#[derive(Error, Debug)]
pub enum SQLError {
    #[error("query error: {0}")]
    Query(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// A UNIQUE / CHECK / FOREIGN KEY / NOT NULL violation. The payload is
    /// the driver message, untouched.
    #[error("{0}")]
    Constraint(String),
}

impl SQLError {
    /// The error text without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            SQLError::Query(m)
            | SQLError::Execution(m)
            | SQLError::Connection(m)
            | SQLError::Constraint(m) => m,
        }
    }
}
