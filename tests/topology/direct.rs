use mock::{self, Cluster};

use mongodb_topology::{Client, Error};
use mongodb_topology::common::ReadPreference;
use mongodb_topology::settings::ConnectionMode;
use mongodb_topology::topology::{Proxy, ProxyState, ServerProxy, ServerState};

#[test]
fn single_seed_connects_directly() {
    let cluster = Cluster::new();
    cluster.standalone("solo:27017");
    let client = Client::with_context(cluster.context(mock::settings(&["solo:27017"]))).unwrap();

    match **client.proxy() {
        Proxy::Direct(_) => {}
        ref other => panic!("expected a direct proxy, got {}", other.kind()),
    }

    let instance = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(mock::address("solo:27017"), instance.address());
    assert_eq!(ProxyState::Connected, client.state());
    assert_eq!(1, client.proxy().connection_attempt());

    client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(1, client.proxy().connection_attempt());
}

#[test]
fn direct_mode_ignores_the_role() {
    let cluster = Cluster::new();
    cluster.secondary("member:27017", "rs0", "elsewhere:27017", &["member:27017", "elsewhere:27017"]);
    let mut settings = mock::settings(&["member:27017"]);
    settings.connection_mode = ConnectionMode::Direct;
    let client = Client::with_context(cluster.context(settings)).unwrap();

    let instance = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert!(instance.is_secondary());
    assert_eq!(Some("rs0".to_owned()), client.proxy().replica_set_name());
    assert!(client.proxy().primary().is_none());
    assert_eq!(1, client.instances().len());
}

#[test]
fn failure_is_reported_with_its_cause() {
    let cluster = Cluster::new();
    cluster.standalone("down:27017");
    cluster.set_up("down:27017", false);
    let client = Client::with_context(cluster.context(mock::settings(&["down:27017"]))).unwrap();

    let err = client.choose_server_instance(&ReadPreference::primary()).unwrap_err();
    match err {
        Error::ConnectionFailed { ref causes, .. } => {
            assert_eq!(1, causes.len());
            assert_eq!(mock::address("down:27017"), causes[0].0);
        }
        ref other => panic!("expected a connection failure, got {:?}", other),
    }
    assert_eq!(ProxyState::Disconnected, client.state());
    assert!(client.instances()[0].connect_error().is_some());

    cluster.set_up("down:27017", true);
    client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(2, client.proxy().connection_attempt());
    assert!(client.instances()[0].connect_error().is_none());
}

#[test]
fn disconnect_and_reconnect() {
    let cluster = Cluster::new();
    cluster.standalone("solo:27017");
    let client = Client::with_context(cluster.context(mock::settings(&["solo:27017"]))).unwrap();

    client.connect(&ReadPreference::primary()).unwrap();
    let instance = client.instances()[0].clone();
    assert_eq!(ServerState::Connected, instance.state());

    client.disconnect();
    assert_eq!(ServerState::Disconnected, instance.state());
    assert_eq!(0, instance.connection_pool().pool_size());

    client.connect(&ReadPreference::primary()).unwrap();
    assert_eq!(ServerState::Connected, instance.state());
    client.ping().unwrap();
    client.verify_state().unwrap();
}
