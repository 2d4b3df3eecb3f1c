use mock::{self, Cluster};

use mongodb_topology::Client;
use mongodb_topology::common::ReadPreference;
use mongodb_topology::topology::{DiscoveringProxy, Proxy, ProxyState, ServerProxy};

fn discovering(client: &Client) -> &DiscoveringProxy {
    match **client.proxy() {
        Proxy::Discovering(ref proxy) => proxy,
        ref other => panic!("expected a discovering proxy, got {}", other.kind()),
    }
}

#[test]
fn standalone_seed_resolves_to_direct() {
    let cluster = Cluster::new();
    cluster.standalone("down:27017");
    cluster.set_up("down:27017", false);
    cluster.standalone("solo:27017");

    let client = Client::with_context(cluster.context(mock::settings(&["down:27017", "solo:27017"]))).unwrap();
    let proxy = discovering(&client);
    assert!(proxy.resolved().is_none());
    assert_eq!(ProxyState::Disconnected, client.state());

    let instance = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(mock::address("solo:27017"), instance.address());

    let resolved = proxy.resolved().unwrap();
    assert_eq!("direct", resolved.kind());
    assert_eq!(1, client.instances().len());
    assert_eq!(ProxyState::Connected, client.state());

    let attempts = client.proxy().connection_attempt();
    client.choose_server_instance(&ReadPreference::primary()).unwrap();
    client.choose_server_instance(&ReadPreference::nearest()).unwrap();
    assert_eq!(attempts, client.proxy().connection_attempt());
}

#[test]
fn replica_set_member_resolves_to_replica_set() {
    let cluster = Cluster::new();
    cluster.primary("rs-a:27017", "rs0", &["rs-a:27017", "rs-b:27017"]);
    cluster.secondary("rs-b:27017", "rs0", "rs-a:27017", &["rs-a:27017", "rs-b:27017"]);

    let client = Client::with_context(cluster.context(mock::settings(&["rs-a:27017", "rs-b:27017"]))).unwrap();
    let instance = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert!(instance.is_primary());

    let resolved = discovering(&client).resolved().unwrap();
    assert_eq!("replica set", resolved.kind());
    assert!(mock::eventually(|| client.proxy().replica_set_name() == Some("rs0".to_owned())));
    assert!(mock::eventually(|| client.state() == ProxyState::Connected));
}

#[test]
fn router_seed_resolves_to_sharded() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    cluster.router("mongos-b:27017");

    let client = Client::with_context(cluster.context(mock::settings(&["mongos-a:27017", "mongos-b:27017"])))
        .unwrap();
    client.connect(&ReadPreference::nearest()).unwrap();

    let resolved = discovering(&client).resolved().unwrap();
    assert_eq!("sharded", resolved.kind());
    assert_eq!(2, client.instances().len());
}

#[test]
fn no_reachable_seed() {
    let cluster = Cluster::new();
    cluster.standalone("down-a:27017");
    cluster.standalone("down-b:27017");
    cluster.set_up("down-a:27017", false);
    cluster.set_up("down-b:27017", false);

    let client = Client::with_context(cluster.context(mock::settings(&["down-a:27017", "down-b:27017"]))).unwrap();
    let err = client.choose_server_instance(&ReadPreference::primary()).unwrap_err();
    assert_eq!(2, err.causes().len());

    assert!(discovering(&client).resolved().is_none());
    assert_eq!(ProxyState::Disconnected, client.state());
    assert_eq!(1, client.proxy().connection_attempt());
}
