use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Queue {queue} does not exist"))]
    QueueNotFound { queue: String },

    #[snafu(display("Queue {queue} already exists with a different listener or options"))]
    QueueExists { queue: String },

    #[snafu(display("Queue {queue} has been disposed"))]
    QueueDisposed { queue: String },

    #[snafu(display("Queueing service has been disposed"))]
    ServiceDisposed,

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Queue {queue} is faulted and rejects enqueues until reinitialized"))]
    QueueFaulted { queue: String },

    #[snafu(display("Invalid queue options: {message}"))]
    InvalidOptions { message: String },

    #[snafu(display("Invalid security token"))]
    InvalidToken {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Invalid header {header}"))]
    InvalidHeader { header: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn invalid_token(e: impl Into<eyre::Report>) -> Self {
        Self::InvalidToken {
            source: Some(e.into()),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    /// Whether the failure is worth retrying at the engine/store boundary.
    ///
    /// I/O interruptions, pool exhaustion and SQLite lock contention clear up
    /// on their own; schema mismatches and constraint violations do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx { source } => match source {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6)
                sqlx::Error::Database(db_err) => {
                    matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}
