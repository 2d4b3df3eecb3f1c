//! Credentials and the authentication collaborator.
//!
//! The mechanism used to prove an identity to the server is supplied by the
//! embedder through the `Authenticator` trait. This crate only tracks which
//! databases each connection is authenticated against.
use bson::{Bson, Document};
use Result;
use Error::{OperationError, ResponseError};

use connection::Connection;

use std::fmt;

pub const ADMIN_DATABASE: &'static str = "admin";

/// A username and password, optionally scoped to the admin database.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MongoCredentials {
    pub username: String,
    pub password: String,
    /// Credentials for the admin database grant access to every database.
    pub admin: bool,
}

impl MongoCredentials {
    pub fn new(username: &str, password: &str, admin: bool) -> MongoCredentials {
        MongoCredentials {
            username: username.to_owned(),
            password: password.to_owned(),
            admin: admin,
        }
    }
}

impl fmt::Debug for MongoCredentials {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("MongoCredentials")
            .field("username", &self.username)
            .field("admin", &self.admin)
            .finish()
    }
}

/// The database an operation targets together with the credentials it
/// should run under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub database: String,
    pub credentials: Option<MongoCredentials>,
}

impl AuthContext {
    pub fn new(database: &str, credentials: Option<MongoCredentials>) -> AuthContext {
        AuthContext {
            database: database.to_owned(),
            credentials: credentials,
        }
    }

    /// A context that requires an unauthenticated connection.
    pub fn anonymous(database: &str) -> AuthContext {
        AuthContext::new(database, None)
    }

    /// The database the credentials are checked against: `admin` for admin
    /// credentials, otherwise the target database.
    pub fn authentication_database(&self) -> Option<&str> {
        self.credentials.as_ref().map(|credentials| {
            if credentials.admin {
                ADMIN_DATABASE
            } else {
                &self.database[..]
            }
        })
    }
}

/// Proves an identity to a server over an open connection.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self,
                    connection: &mut Connection,
                    database: &str,
                    credentials: &MongoCredentials)
                    -> Result<()>;

    /// Runs `{logout: 1}` against the database.
    fn logout(&self, connection: &mut Connection, database: &str) -> Result<()> {
        let reply = connection.run_command(database, doc! { "logout": 1 })?;
        if command_ok(&reply) {
            Ok(())
        } else {
            Err(ResponseError(format!("Error logging out of database '{}'.", database)))
        }
    }
}

// Used when no authenticator has been configured.
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _: &mut Connection, database: &str, credentials: &MongoCredentials) -> Result<()> {
        Err(OperationError(format!("No authenticator is configured to authenticate '{}' against '{}'.",
                                   credentials.username,
                                   database)))
    }
}

/// Reads the `ok` field of a command reply.
pub fn command_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(&Bson::I32(v)) => v != 0,
        Some(&Bson::I64(v)) => v != 0,
        Some(&Bson::FloatingPoint(v)) => v != 0.0,
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    }
}
