use mongodb_topology::Error;
use mongodb_topology::connstring::ServerAddress;
use mongodb_topology::settings::{ConnectionMode, ServerSettings};
use serde_json;

use std::time::Duration;

#[test]
fn defaults() {
    let settings = ServerSettings::default();
    assert_eq!(vec![ServerAddress::new("localhost", 27017)], settings.hosts);
    assert_eq!(ConnectionMode::Automatic, settings.connection_mode);
    assert_eq!(100, settings.max_connection_pool_size);
    assert_eq!(500, settings.wait_queue_size);
    assert_eq!(Duration::from_secs(30), settings.connect_timeout);
    assert!(settings.validate().is_ok());
}

#[test]
fn from_uri_options() {
    let uri = "mongodb://admin:secret@a:1,b:2/admin?replicaSet=rs0&connectTimeoutMS=2500&maxPoolSize=10&\
               waitQueueMultiple=3&minPoolSize=2&connect=replicaSet&unknownOption=1";
    let settings = ServerSettings::from_uri(uri).unwrap();

    assert_eq!(vec![ServerAddress::new("a", 1), ServerAddress::new("b", 2)], settings.hosts);
    assert_eq!(Some("rs0".to_owned()), settings.replica_set_name);
    assert_eq!(ConnectionMode::ReplicaSet, settings.connection_mode);
    assert_eq!(Duration::from_millis(2500), settings.connect_timeout);
    assert_eq!(10, settings.max_connection_pool_size);
    assert_eq!(2, settings.min_connection_pool_size);
    assert_eq!(30, settings.wait_queue_size);

    let credentials = settings.credentials.unwrap();
    assert_eq!("admin", credentials.username);
    assert_eq!("secret", credentials.password);
    assert!(credentials.admin);
}

#[test]
fn malformed_options_are_rejected() {
    assert!(ServerSettings::from_uri("mongodb://a/?connectTimeoutMS=soon").is_err());
    assert!(ServerSettings::from_uri("mongodb://a/?maxPoolSize=-1").is_err());
    assert!(ServerSettings::from_uri("mongodb://a/?connect=sideways").is_err());
}

#[test]
fn validation() {
    let mut settings = ServerSettings::default();
    settings.min_connection_pool_size = 5;
    settings.max_connection_pool_size = 4;
    match settings.validate() {
        Err(Error::ArgumentError(_)) => {}
        other => panic!("expected an argument error, got {:?}", other),
    }

    let direct = ServerSettings::from_uri("mongodb://a,b/?connect=direct");
    assert!(direct.is_err());

    let mut settings = ServerSettings::default();
    settings.hosts.clear();
    assert!(settings.validate().is_err());

    let mut settings = ServerSettings::default();
    settings.max_connection_pool_size = 0;
    assert!(settings.validate().is_err());
}

#[test]
fn deserialize_from_json() {
    let json = r#"{
        "hosts": ["db1.example.com:27017", "db2.example.com:27018"],
        "connect": "shardRouter",
        "connectTimeoutMS": 1500,
        "maxPoolSize": 7,
        "pingWindowSize": 3
    }"#;

    let settings: ServerSettings = serde_json::from_str(json).unwrap();
    assert_eq!(ServerAddress::new("db2.example.com", 27018), settings.hosts[1]);
    assert_eq!(ConnectionMode::ShardRouter, settings.connection_mode);
    assert_eq!(Duration::from_millis(1500), settings.connect_timeout);
    assert_eq!(7, settings.max_connection_pool_size);
    assert_eq!(3, settings.ping_window_size);
    assert_eq!(ServerSettings::default().wait_queue_timeout, settings.wait_queue_timeout);
}

#[test]
fn serialize_to_json() {
    let settings = ServerSettings::with_hosts(vec![ServerAddress::new("a", 1)]);
    let value = serde_json::to_value(&settings).unwrap();
    assert_eq!("a:1", value["hosts"][0]);
    assert_eq!("automatic", value["connect"]);
    assert_eq!(30000, value["connectTimeoutMS"]);
    assert!(value.get("credentials").is_none());

    let back: ServerSettings = serde_json::from_value(value).unwrap();
    assert_eq!(settings, back);
}
