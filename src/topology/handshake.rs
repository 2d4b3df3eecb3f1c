//! The isMaster handshake and the commands used to monitor an instance.
use Result;
use Error::{ArgumentError, ResponseError};

use auth::command_ok;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use connection::Connection;
use connstring::{self, ServerAddress};
use topology::instance::InstanceType;

use std::collections::BTreeMap;

const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i64 = 48000000;

/// The result of an isMaster command.
#[derive(Clone, Debug, PartialEq)]
pub struct IsMasterResult {
    pub ok: bool,
    pub is_master: bool,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub local_time: Option<DateTime<Utc>>,
    pub min_wire_version: i64,
    pub max_wire_version: i64,

    /// Shard routers report "isdbgrid" here.
    pub msg: String,

    // Replica set specific
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub me: Option<ServerAddress>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub arbiter_only: bool,
    pub passive: bool,
    pub hidden: bool,
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub primary: Option<ServerAddress>,
}

fn as_i64(bson: Option<&Bson>) -> Option<i64> {
    match bson {
        Some(&Bson::I32(v)) => Some(i64::from(v)),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

fn as_bool(bson: Option<&Bson>) -> bool {
    match bson {
        Some(&Bson::Boolean(b)) => b,
        other => as_i64(other).map_or(false, |v| v != 0),
    }
}

fn addresses(bson: Option<&Bson>) -> Vec<ServerAddress> {
    match bson {
        Some(&Bson::Array(ref arr)) => {
            arr.iter()
                .filter_map(|bson| match *bson {
                    Bson::String(ref s) => connstring::parse_host(s).ok(),
                    _ => None,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

impl IsMasterResult {
    /// Parses an isMaster response document from the server.
    pub fn new(doc: Document) -> Result<IsMasterResult> {
        let ok = match doc.get("ok") {
            Some(&Bson::Boolean(b)) => b,
            ok @ Some(_) => as_i64(ok).map_or(false, |v| v != 0),
            None => return Err(ArgumentError("result does not contain `ok`.".to_owned())),
        };

        let mut result = IsMasterResult {
            ok: ok,
            is_master: as_bool(doc.get("ismaster")),
            max_bson_object_size: as_i64(doc.get("maxBsonObjectSize")).unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_message_size_bytes: as_i64(doc.get("maxMessageSizeBytes")).unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            local_time: None,
            min_wire_version: as_i64(doc.get("minWireVersion")).unwrap_or(-1),
            max_wire_version: as_i64(doc.get("maxWireVersion")).unwrap_or(-1),
            msg: String::new(),
            is_replica_set: as_bool(doc.get("isreplicaset")),
            is_secondary: as_bool(doc.get("secondary")),
            me: None,
            hosts: addresses(doc.get("hosts")),
            passives: addresses(doc.get("passives")),
            arbiters: addresses(doc.get("arbiters")),
            arbiter_only: as_bool(doc.get("arbiterOnly")),
            passive: as_bool(doc.get("passive")),
            hidden: as_bool(doc.get("hidden")),
            tags: BTreeMap::new(),
            set_name: None,
            primary: None,
        };

        if let Some(&Bson::UtcDatetime(ref datetime)) = doc.get("localTime") {
            result.local_time = Some(*datetime);
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = Some(s.to_owned());
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        Ok(result)
    }

    /// The role this response describes.
    pub fn instance_type(&self) -> InstanceType {
        if self.set_name.is_some() || self.is_replica_set {
            InstanceType::ReplicaSetMember
        } else if self.msg == "isdbgrid" {
            InstanceType::ShardRouter
        } else {
            InstanceType::Standalone
        }
    }

    /// Every member this response knows about: hosts, then passives, then
    /// arbiters, without duplicates.
    pub fn members(&self) -> Vec<ServerAddress> {
        let mut members: Vec<ServerAddress> = Vec::new();
        for address in self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter()) {
            if !members.contains(address) {
                members.push(address.clone());
            }
        }
        members
    }
}

/// Runs the monitoring commands against an instance. Implemented by
/// `WireCommandRunner` for real servers and replaceable for embedding and
/// testing.
pub trait CommandRunner: Send + Sync {
    fn is_master(&self, connection: &mut Connection) -> Result<IsMasterResult>;
    fn ping(&self, connection: &mut Connection) -> Result<()>;
}

/// Runs `isMaster` and `ping` as OP_QUERY commands against `admin.$cmd`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireCommandRunner;

impl CommandRunner for WireCommandRunner {
    // Sends the client metadata along with the isMaster command.
    //
    // See https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
    fn is_master(&self, connection: &mut Connection) -> Result<IsMasterResult> {
        let reply = connection.run_command("admin", doc! {
            "isMaster": 1i32,
            "client": {
                "driver": {
                    "name": ::DRIVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "os": {
                    "type": ::std::env::consts::OS,
                    "architecture": ::std::env::consts::ARCH
                }
            },
        })?;

        let result = IsMasterResult::new(reply)?;
        if !result.ok {
            return Err(ResponseError("isMaster command failed.".to_owned()));
        }
        Ok(result)
    }

    fn ping(&self, connection: &mut Connection) -> Result<()> {
        let reply = connection.run_command("admin", doc! { "ping": 1i32 })?;
        if command_ok(&reply) {
            Ok(())
        } else {
            Err(ResponseError("ping command failed.".to_owned()))
        }
    }
}
