use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::trace;

use crate::db::open_connection;
use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub id: i64,
    pub username: String,
}

/// Per-request state: a lazily opened storage connection and the caller's identity.
///
/// The connection is opened on first use and closed when the context is dropped at
/// the end of the request.
pub struct RequestContext {
    db_path: PathBuf,
    connection: Mutex<Option<Connection>>,
    user: Option<AuthenticatedUser>,
}

impl RequestContext {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            connection: Mutex::new(None),
            user: None,
        }
    }

    pub fn set_user(&mut self, user: Option<AuthenticatedUser>) {
        self.user = user;
    }

    pub fn user(&self) -> Option<&AuthenticatedUser> {
        self.user.as_ref()
    }

    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut slot = self.connection.lock();
        let connection = match slot.take() {
            Some(connection) => connection,
            None => {
                trace!(path = %self.db_path.display(), "opening request connection");
                open_connection(&self.db_path)?
            }
        };
        f(slot.insert(connection))
    }

    pub fn connection_opened(&self) -> bool {
        self.connection.lock().is_some()
    }
}
