use mock::{self, Cluster};

use mongodb_topology::{Client, Error};
use mongodb_topology::common::ReadPreference;
use mongodb_topology::settings::ConnectionMode;
use mongodb_topology::topology::{Proxy, ProxyState, ServerInstance, ServerProxy, ShardedProxy};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn sharded(client: &Client) -> &ShardedProxy {
    match **client.proxy() {
        Proxy::Sharded(ref proxy) => proxy,
        ref other => panic!("expected a sharded proxy, got {}", other.kind()),
    }
}

fn client(cluster: &Cluster, seeds: &[&str]) -> Client {
    let mut settings = mock::settings(seeds);
    settings.connection_mode = ConnectionMode::ShardRouter;
    Client::with_context(cluster.context(settings)).unwrap()
}

#[test]
fn connects_to_every_router() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    cluster.router("mongos-b:27017");
    let client = client(&cluster, &["mongos-a:27017", "mongos-b:27017"]);

    let instance = client.choose_server_instance(&ReadPreference::nearest()).unwrap();
    assert!(instance.address().host.starts_with("mongos-"));
    assert!(mock::eventually(|| sharded(&client).connected_instances().len() == 2));
    assert_eq!(ProxyState::Connected, client.state());
    assert!(client.proxy().replica_set_name().is_none());
}

#[test]
fn one_router_is_enough() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    cluster.router("mongos-b:27017");
    cluster.set_up("mongos-a:27017", false);
    let client = client(&cluster, &["mongos-a:27017", "mongos-b:27017"]);

    let instance = client.choose_server_instance(&ReadPreference::nearest()).unwrap();
    assert_eq!(mock::address("mongos-b:27017"), instance.address());
    assert!(mock::eventually(|| client.state() == ProxyState::Connected));
    assert_eq!(2, client.instances().len());
}

#[test]
fn non_router_is_dropped() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    cluster.standalone("plain:27017");
    let client = client(&cluster, &["mongos-a:27017", "plain:27017"]);
    let plain = client.instances()[1].clone();

    client.connect(&ReadPreference::nearest()).unwrap();
    assert!(mock::eventually(|| client.instances().len() == 1));
    assert!(plain.is_permanently_disconnected());
    match *plain.connect_error().unwrap() {
        Error::TopologyMismatch(_) => {}
        ref other => panic!("expected a topology mismatch, got {:?}", other),
    }
}

#[test]
fn no_router_reachable() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    cluster.set_up("mongos-a:27017", false);

    let mut settings = mock::settings(&["mongos-a:27017"]);
    settings.connection_mode = ConnectionMode::ShardRouter;
    settings.connect_timeout = Duration::from_millis(300);
    let client = Client::with_context(cluster.context(settings)).unwrap();

    let err = client.connect(&ReadPreference::nearest()).unwrap_err();
    assert_eq!(1, err.causes().len());
    assert!(mock::eventually(|| client.state() == ProxyState::Disconnected));
}

#[test]
fn router_alias_is_merged_into_its_reported_address() {
    let cluster = Cluster::new();
    cluster.add("mongos-a:27017",
                doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid", "me": "mongos-a:27017" });
    cluster.alias("alias:27017", "mongos-a:27017");
    let client = client(&cluster, &["alias:27017", "mongos-a:27017"]);

    client.connect(&ReadPreference::nearest()).unwrap();
    assert!(mock::eventually(|| client.instances().len() == 1));
    assert_eq!(mock::address("mongos-a:27017"), client.instances()[0].address());
    assert!(mock::eventually(|| sharded(&client).connected_instances().len() == 1));
}

#[test]
fn selection_failure_after_connecting_reports_causes() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    let client = client(&cluster, &["mongos-a:27017", "mongos-down:27017"]);

    // Accepts a router once, giving the refused connect time to land, then
    // nothing.
    let calls = AtomicUsize::new(0);
    let once = |instances: &[Arc<ServerInstance>]| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(200));
            instances.first().cloned()
        } else {
            None
        }
    };

    let err = client.choose_server_instance(&once).unwrap_err();
    let failed: Vec<_> = err.causes().iter().map(|&(ref address, _)| address.clone()).collect();
    assert_eq!(vec![mock::address("mongos-down:27017")], failed);
}
