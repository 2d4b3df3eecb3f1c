//! A single physical connection to a server instance.
use {Error, Result};
use Error::{ConnectionClosed, InternalInvariant, OperationError, ResponseError};

use auth::{AuthContext, Authenticator, MongoCredentials, NoAuthenticator, ADMIN_DATABASE};
use connstring::ServerAddress;
use stream::{SocketOptions, Stream};
use topology::{ServerContext, ServerState};
use topology::instance::ServerInstance;
use wire_protocol::Message;
use wire_protocol::flags::OpQueryFlags;

use bson::Document;
use bufstream::BufStream;
use chrono::{DateTime, Utc};

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Instant;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);
static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Returns the next request id. Every request message sent by this process
/// draws from the same counter.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// The lifecycle of a connection. A closed connection is never reopened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Open,
    Closed,
}

/// Records the credentials a database was authenticated with and when the
/// authentication was last relied upon.
#[derive(Clone, Debug)]
pub struct Authentication {
    pub credentials: MongoCredentials,
    pub last_used: DateTime<Utc>,
}

impl Authentication {
    fn new(credentials: MongoCredentials) -> Authentication {
        Authentication {
            credentials: credentials,
            last_used: Utc::now(),
        }
    }
}

// What to do with a connection after an operation on it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
enum ErrorAction {
    KeepConnection,
    CloseConnection,
    // TODO: return this for "shutdown in progress" (code 91) replies once
    // command errors are classified here.
    ClearConnectionPool,
}

fn determine_action(err: &Error) -> ErrorAction {
    match *err {
        // Nothing reached the socket.
        Error::ArgumentError(_) | Error::EncoderError(_) => ErrorAction::KeepConnection,
        // Only errors that prove every pooled socket is dead may clear the pool.
        _ => ErrorAction::CloseConnection,
    }
}

/// A physical channel to one server instance, owned by that instance's pool.
pub struct Connection {
    id: usize,
    instance: Weak<ServerInstance>,
    context: Arc<ServerContext>,
    pool_id: usize,
    generation_id: usize,
    state: ConnectionState,
    stream: Option<BufStream<Stream>>,
    created_at: Instant,
    last_used_at: Instant,
    authentications: HashMap<String, Authentication>,
    message_counter: usize,
    request_id: i32,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("generation_id", &self.generation_id)
            .field("state", &self.state)
            .field("databases", &self.authentications.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(instance: Weak<ServerInstance>,
                      context: Arc<ServerContext>,
                      pool_id: usize,
                      generation_id: usize)
                      -> Connection {
        let now = Instant::now();
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            instance: instance,
            context: context,
            pool_id: pool_id,
            generation_id: generation_id,
            state: ConnectionState::Initial,
            stream: None,
            created_at: now,
            last_used_at: now,
            authentications: HashMap::new(),
            message_counter: 0,
            request_id: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pool_id(&self) -> usize {
        self.pool_id
    }

    /// The generation of the pool at the time this connection was created.
    pub fn generation_id(&self) -> usize {
        self.generation_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Updated every time the connection is released to its pool.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub(crate) fn set_last_used_at(&mut self, at: Instant) {
        self.last_used_at = at;
    }

    /// The number of messages sent over this connection.
    pub fn message_counter(&self) -> usize {
        self.message_counter
    }

    /// The request id of the last message sent.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn server_instance(&self) -> Option<Arc<ServerInstance>> {
        self.instance.upgrade()
    }

    pub fn address(&self) -> Option<ServerAddress> {
        self.instance.upgrade().map(|instance| instance.address())
    }

    /// Opens the socket to the owning instance's current address. May only
    /// be called once.
    pub fn open(&mut self) -> Result<()> {
        if self.state != ConnectionState::Initial {
            return Err(OperationError("Open called more than once.".to_owned()));
        }

        let address = match self.address() {
            Some(address) => address,
            None => {
                self.state = ConnectionState::Closed;
                return Err(ConnectionClosed("The server instance no longer exists.".to_owned()));
            }
        };

        let options = SocketOptions::from(&self.context.settings);
        match self.context.connector.connect(&address, &options) {
            Ok(stream) => {
                debug!("connection {} opened to {}", self.id, address);
                self.stream = Some(BufStream::new(stream));
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(Error::from(err))
            }
        }
    }

    /// Releases the socket. Safe to call in any state.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
            let _ = stream.get_mut().shutdown();
        }

        self.state = ConnectionState::Closed;
        debug!("connection {} closed", self.id);
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Initial => Err(ConnectionClosed("Connection is not open.".to_owned())),
            ConnectionState::Closed => Err(ConnectionClosed("Connection is closed.".to_owned())),
        }
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            Err(ConnectionClosed("Connection is closed.".to_owned()))
        } else {
            Ok(())
        }
    }

    fn handle_error(&mut self, err: &Error) {
        let action = determine_action(err);
        match action {
            ErrorAction::KeepConnection => return,
            ErrorAction::CloseConnection => self.close(),
            ErrorAction::ClearConnectionPool => {
                self.close();
                if let Some(instance) = self.instance.upgrade() {
                    instance.connection_pool().clear();
                }
            }
        }

        warn!("connection {} failed and was closed: {}", self.id, err);

        // Forces a state verification before the instance is used again.
        if let Some(instance) = self.instance.upgrade() {
            instance.set_state(ServerState::Unknown);
        }
    }

    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        self.check_open()?;
        self.request_id = message.request_id();

        let result = match self.stream {
            Some(ref mut stream) => message.write(stream),
            None => Err(ConnectionClosed("Connection has no stream.".to_owned())),
        };

        match result {
            Ok(()) => {
                self.message_counter += 1;
                Ok(())
            }
            Err(err) => {
                self.handle_error(&err);
                Err(err)
            }
        }
    }

    pub fn receive_message(&mut self) -> Result<Message> {
        self.check_open()?;

        let result = match self.stream {
            Some(ref mut stream) => Message::read(stream),
            None => Err(ConnectionClosed("Connection has no stream.".to_owned())),
        };

        result.map_err(|err| {
            self.handle_error(&err);
            err
        })
    }

    /// Runs a command against `database` and returns the server's reply
    /// document. The `ok` field is left for the caller to interpret.
    pub fn run_command(&mut self, database: &str, command: Document) -> Result<Document> {
        let command_name = command.keys().next().cloned().unwrap_or_default();
        let namespace = format!("{}.$cmd", database);
        let message = Message::new_query(next_request_id(), OpQueryFlags::for_command(), &namespace, 0, 1, command)?;
        let request_id = message.request_id();

        self.send_message(&message)?;
        let reply = self.receive_message()?;

        if reply.header().response_to != request_id {
            let err = ResponseError(format!("Reply to '{}' answered request {} instead of {}.",
                                            command_name,
                                            reply.header().response_to,
                                            request_id));
            self.handle_error(&err);
            return Err(err);
        }

        let mut documents = reply.into_documents()?;
        if documents.is_empty() {
            return Err(ResponseError(format!("Command '{}' failed. No response returned.", command_name)));
        }
        Ok(documents.swap_remove(0))
    }

    fn authenticator(&self) -> Arc<dyn Authenticator> {
        match self.context.authenticator {
            Some(ref authenticator) => authenticator.clone(),
            None => Arc::new(NoAuthenticator),
        }
    }

    /// Authenticates `database` with `credentials` on this connection.
    pub fn authenticate(&mut self, database: &str, credentials: &MongoCredentials) -> Result<()> {
        self.check_not_closed()?;

        if self.authentications.contains_key(database) {
            return Err(InternalInvariant(format!("Connection is already authenticated to '{}'.", database)));
        }
        if database == ADMIN_DATABASE && !self.authentications.is_empty() {
            return Err(InternalInvariant("The connection cannot be authenticated against the admin database \
                                          because it is already authenticated against other databases."
                .to_owned()));
        }
        if self.authentications.contains_key(ADMIN_DATABASE) {
            return Err(InternalInvariant("The connection is already authenticated against the admin database."
                .to_owned()));
        }

        let authenticator = self.authenticator();
        authenticator.authenticate(self, database, credentials)?;

        debug!("connection {} authenticated to '{}' as '{}'", self.id, database, credentials.username);
        self.authentications.insert(database.to_owned(), Authentication::new(credentials.clone()));
        Ok(())
    }

    /// Logs out of `database` and forgets its authentication.
    pub fn logout(&mut self, database: &str) -> Result<()> {
        self.check_not_closed()?;
        let authenticator = self.authenticator();
        authenticator.logout(self, database)?;
        self.authentications.remove(database);
        Ok(())
    }

    /// Returns true if the connection can serve `context` as it is.
    pub fn is_authenticated(&self, context: Option<&AuthContext>) -> Result<bool> {
        self.check_not_closed()?;

        let context = match context {
            Some(context) => context,
            None => return Ok(true),
        };

        match (context.authentication_database(), context.credentials.as_ref()) {
            (Some(database), Some(credentials)) => {
                Ok(self.authentications
                    .get(database)
                    .map_or(false, |auth| auth.credentials == *credentials))
            }
            _ => Ok(self.authentications.is_empty()),
        }
    }

    /// Returns true if the connection could be authenticated for `context`
    /// without conflicting with its existing authentications. Assumes
    /// `is_authenticated` returned false.
    pub fn can_authenticate(&self, context: Option<&AuthContext>) -> Result<bool> {
        self.check_not_closed()?;

        let context = match context {
            Some(context) => context,
            None => return Ok(true),
        };

        if self.authentications.is_empty() {
            return Ok(true);
        }

        let credentials = match context.credentials {
            Some(ref credentials) => credentials,
            // Existing authentications can't be used without credentials.
            None => return Ok(false),
        };

        if credentials.admin {
            return Ok(false);
        }

        if self.authentications.contains_key(ADMIN_DATABASE) {
            return Ok(false);
        }

        Ok(!self.authentications.contains_key(&context.database))
    }

    /// Makes the connection's authentications match `context`, authenticating
    /// if needed. A conflicting authentication is an internal error since the
    /// pool only hands out connections that can serve the context.
    pub fn check_authentication(&mut self, context: &AuthContext) -> Result<()> {
        self.check_not_closed()?;

        let credentials = match context.credentials {
            Some(ref credentials) => credentials.clone(),
            None => {
                if !self.authentications.is_empty() {
                    return Err(InternalInvariant("Connection requires credentials.".to_owned()));
                }
                return Ok(());
            }
        };

        let database = if credentials.admin {
            ADMIN_DATABASE.to_owned()
        } else {
            context.database.clone()
        };

        if let Some(authentication) = self.authentications.get_mut(&database) {
            if authentication.credentials != credentials {
                return Err(if database == ADMIN_DATABASE {
                    InternalInvariant("Connection already authenticated to the admin database with different \
                                       credentials."
                        .to_owned())
                } else {
                    InternalInvariant(format!("Connection already authenticated to '{}' with different credentials.",
                                              database))
                });
            }
            authentication.last_used = Utc::now();
            return Ok(());
        }

        self.authenticate(&database, &credentials)
    }

    /// The databases this connection is authenticated against.
    pub fn authenticated_databases(&self) -> Vec<String> {
        let mut databases: Vec<String> = self.authentications.keys().cloned().collect();
        databases.sort();
        databases
    }

    pub fn authentication(&self, database: &str) -> Option<&Authentication> {
        self.authentications.get(database)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
