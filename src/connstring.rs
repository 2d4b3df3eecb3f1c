//! Server addresses and `mongodb://` connection string parsing.
use {Error, Result};
use Error::ArgumentError;

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &'static str = "mongodb://";

/// The host name and port of a server. Two addresses are equal when both
/// parts match, independent of what the host name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Creates a new address. Host names are lowercased.
    pub fn new(host: &str, port: u16) -> ServerAddress {
        ServerAddress {
            host: host.to_ascii_lowercase(),
            port: port,
        }
    }

    /// Resolves the address to the socket addresses it currently points at.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (&self.host[..], self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound,
                                      format!("{} did not resolve to any address", self)));
        }
        Ok(addrs)
    }
}

impl Default for ServerAddress {
    fn default() -> ServerAddress {
        ServerAddress::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(fmt, "[{}]:{}", self.host, self.port)
        } else {
            write!(fmt, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_host(s)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> String {
        address.to_string()
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        parse_host(&s)
    }
}

/// Encapsulates the options and read preference tags of a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub options: BTreeMap<String, String>,
    pub read_pref_tags: Vec<String>,
}

impl ConnectionOptions {
    pub fn new(options: BTreeMap<String, String>, read_pref_tags: Vec<String>) -> ConnectionOptions {
        ConnectionOptions {
            options: options,
            read_pref_tags: read_pref_tags,
        }
    }

    /// Looks an option up, ignoring the case of its name.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.options
            .iter()
            .find(|&(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }
}

/// A parsed connection string: the seed list, credentials and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<ServerAddress>,
    pub string: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub options: Option<ConnectionOptions>,
}

impl ConnectionString {
    /// Creates a new ConnectionString for a single host.
    pub fn new(host: &str, port: u16) -> ConnectionString {
        ConnectionString {
            hosts: vec![ServerAddress::new(host, port)],
            string: None,
            user: None,
            password: None,
            database: None,
            options: None,
        }
    }
}

/// Parses a MongoDB connection string URI of the form
/// `mongodb://[user:password@]host1[:port1][,host2[:port2]...][/[database][?options]]`.
pub fn parse(address: &str) -> Result<ConnectionString> {
    if !address.starts_with(URI_SCHEME) {
        return Err(ArgumentError("MongoDB connection string must start with 'mongodb://'.".to_owned()));
    }

    let addr = &address[URI_SCHEME.len()..];

    let mut user = None;
    let mut password = None;
    let mut database = None;
    let mut options = None;

    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(ArgumentError("A '/' is required between the host list and any options.".to_owned()));
    }

    let hosts = if host_str.contains('@') {
        let (user_info, host_string) = rpartition(host_str, "@");
        let (u, p) = parse_user_info(user_info)?;
        user = Some(u.to_owned());
        password = Some(p.to_owned());
        split_hosts(host_string)?
    } else {
        split_hosts(host_str)?
    };

    let mut opts = "";
    if !path_str.is_empty() {
        if path_str.starts_with('?') {
            opts = &path_str[1..];
        } else {
            let (dbase, rest) = partition(path_str, "?");
            if !dbase.is_empty() {
                database = Some(dbase.to_owned());
            }
            opts = rest;
        }
    }

    if !opts.is_empty() {
        options = Some(split_options(opts)?);
    }

    Ok(ConnectionString {
        hosts: hosts,
        string: Some(address.to_owned()),
        user: user,
        password: password,
        database: database,
        options: options,
    })
}

// Parse user information of the form user:password
fn parse_user_info(user_info: &str) -> Result<(&str, &str)> {
    let (user, password) = rpartition(user_info, ":");
    if user_info.contains('@') || user.contains(':') {
        return Err(ArgumentError("':' or '@' characters in a username or password must be escaped according to RFC 2396.".to_owned()));
    }
    if user.is_empty() {
        return Err(ArgumentError("The empty string is not a valid username.".to_owned()));
    }
    Ok((user, password))
}

// Parses an IPv6 literal of the form [host] or [host]:port
fn parse_ipv6_literal_host(entity: &str) -> Result<ServerAddress> {
    match entity.find(']') {
        Some(idx) => {
            let host = &entity[1..idx];
            let rest = &entity[idx + 1..];
            if rest.is_empty() {
                Ok(ServerAddress::new(host, DEFAULT_PORT))
            } else if rest.starts_with(':') {
                match rest[1..].parse::<u16>() {
                    Ok(port) => Ok(ServerAddress::new(host, port)),
                    Err(_) => Err(ArgumentError("Port must be an integer.".to_owned())),
                }
            } else {
                Err(ArgumentError(format!("Invalid IPv6 host '{}'.", entity)))
            }
        }
        None => Err(ArgumentError("An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.".to_owned())),
    }
}

/// Parses a host entity of the form `host` or `host:port`. IPv6 literals
/// must be bracketed. All host names are lowercased.
pub fn parse_host(entity: &str) -> Result<ServerAddress> {
    if entity.is_empty() {
        return Err(ArgumentError("Empty host.".to_owned()));
    }

    if entity.starts_with('[') {
        parse_ipv6_literal_host(entity)
    } else if entity.contains(':') {
        let (host, port) = partition(entity, ":");
        if port.contains(':') {
            return Err(ArgumentError("Reserved characters such as ':' must be escaped according to RFC 2396. \
                                      An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732."
                .to_owned()));
        }
        match port.parse::<u16>() {
            Ok(val) => Ok(ServerAddress::new(host, val)),
            Err(_) => Err(ArgumentError("Port must be an unsigned integer.".to_owned())),
        }
    } else {
        Ok(ServerAddress::new(entity, DEFAULT_PORT))
    }
}

// Splits and parses comma-separated hosts.
fn split_hosts(host_str: &str) -> Result<Vec<ServerAddress>> {
    let mut hosts = Vec::new();
    for entity in host_str.split(',') {
        if entity.is_empty() {
            return Err(ArgumentError("Empty host, or extra comma in host list.".to_owned()));
        }
        hosts.push(parse_host(entity)?);
    }
    Ok(hosts)
}

// Parses the delimited string into its options and read preference tags.
fn parse_options(opts: &str, delim: Option<&str>) -> ConnectionOptions {
    let mut options = BTreeMap::new();
    let mut read_pref_tags = Vec::new();

    let opt_list: Vec<&str> = match delim {
        Some(delim) => opts.split(delim).collect(),
        None => vec![opts],
    };

    for opt in opt_list {
        if opt.is_empty() {
            continue;
        }
        let (key, val) = partition(opt, "=");
        if key.eq_ignore_ascii_case("readpreferencetags") {
            read_pref_tags.push(val.to_owned());
        } else {
            options.insert(key.to_owned(), val.to_owned());
        }
    }

    ConnectionOptions::new(options, read_pref_tags)
}

// Determines the option delimiter and offloads parsing to parse_options.
fn split_options(opts: &str) -> Result<ConnectionOptions> {
    let has_and = opts.contains('&');
    let has_semi = opts.contains(';');

    let delim = if has_and && has_semi {
        return Err(ArgumentError("Cannot mix '&' and ';' for option separators.".to_owned()));
    } else if has_and {
        Some("&")
    } else if has_semi {
        Some(";")
    } else if !opts.contains('=') {
        return Err(ArgumentError("InvalidURI: MongoDB URI options are key=value pairs.".to_owned()));
    } else {
        None
    };

    Ok(parse_options(opts, delim))
}

// Partitions a string around the left-most occurrence of the separator, if it exists.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator, if it exists.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
