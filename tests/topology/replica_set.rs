use mock::{self, Cluster};

use mongodb_topology::{Client, Error};
use mongodb_topology::common::{ReadMode, ReadPreference};
use mongodb_topology::settings::ConnectionMode;
use mongodb_topology::topology::{Proxy, ProxyState, ReplicaSetProxy, ServerProxy, ServerState};

use std::collections::BTreeSet;
use std::time::Duration;

fn replica_set(client: &Client) -> &ReplicaSetProxy {
    match **client.proxy() {
        Proxy::ReplicaSet(ref proxy) => proxy,
        ref other => panic!("expected a replica set proxy, got {}", other.kind()),
    }
}

fn client(cluster: &Cluster, seeds: &[&str], name: Option<&str>) -> Client {
    let mut settings = mock::settings(seeds);
    settings.connection_mode = ConnectionMode::ReplicaSet;
    settings.replica_set_name = name.map(|name| name.to_owned());
    Client::with_context(cluster.context(settings)).unwrap()
}

fn hosts(client: &Client) -> BTreeSet<String> {
    client.instances().iter().map(|instance| instance.address().host).collect()
}

fn three_members(cluster: &Cluster) {
    let members = ["rs-a:27017", "rs-b:27017", "rs-c:27017"];
    cluster.primary("rs-a:27017", "rs0", &members);
    cluster.secondary("rs-b:27017", "rs0", "rs-a:27017", &members);
    cluster.secondary("rs-c:27017", "rs0", "rs-a:27017", &members);
}

fn set_of(hosts: &[&str]) -> BTreeSet<String> {
    hosts.iter().map(|host| host.to_string()).collect()
}

#[test]
fn discovers_members_from_the_primary() {
    let cluster = Cluster::new();
    three_members(&cluster);
    let client = client(&cluster, &["rs-a:27017"], None);

    client.connect(&ReadPreference::primary()).unwrap();
    assert!(mock::eventually(|| replica_set(&client).connected_instances().len() == 3));
    assert_eq!(set_of(&["rs-a", "rs-b", "rs-c"]), hosts(&client));

    assert_eq!(Some("rs0".to_owned()), client.proxy().replica_set_name());
    assert_eq!(mock::address("rs-a:27017"), client.proxy().primary().unwrap().address());
    assert!(mock::eventually(|| client.state() == ProxyState::Connected));

    let secondary = client.choose_server_instance(&ReadPreference::new(ReadMode::Secondary, None)).unwrap();
    assert!(secondary.is_secondary());
    let primary = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert!(primary.is_primary());
}

#[test]
fn secondary_seed_leads_to_the_primary() {
    let cluster = Cluster::new();
    three_members(&cluster);
    let client = client(&cluster, &["rs-c:27017"], Some("rs0"));

    let primary = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(mock::address("rs-a:27017"), primary.address());
    assert!(mock::eventually(|| hosts(&client).len() == 3));
}

#[test]
fn drops_members_the_primary_does_not_list() {
    let cluster = Cluster::new();
    cluster.primary("rs-a:27017", "rs0", &["rs-a:27017", "rs-b:27017"]);
    cluster.secondary("rs-b:27017", "rs0", "rs-a:27017", &["rs-a:27017", "rs-b:27017"]);
    cluster.secondary("stale:27017", "rs0", "rs-a:27017", &["rs-a:27017", "stale:27017"]);

    let client = client(&cluster, &["rs-a:27017", "stale:27017"], None);
    let stale = client.instances()[1].clone();

    client.connect(&ReadPreference::primary()).unwrap();
    assert!(mock::eventually(|| hosts(&client) == set_of(&["rs-a", "rs-b"])));
    assert!(stale.is_permanently_disconnected());
    assert!(mock::eventually(|| stale.state() == ServerState::Disconnected));
}

#[test]
fn members_of_another_set_are_dropped() {
    let cluster = Cluster::new();
    cluster.primary("wrong:27017", "other", &["wrong:27017"]);
    cluster.primary("rs-a:27017", "rs0", &["rs-a:27017"]);

    let client = client(&cluster, &["wrong:27017", "rs-a:27017"], Some("rs0"));
    let wrong = client.instances()[0].clone();

    client.connect(&ReadPreference::primary()).unwrap();
    assert!(mock::eventually(|| hosts(&client) == set_of(&["rs-a"])));
    assert!(wrong.is_permanently_disconnected());
    assert_eq!(Some("rs0".to_owned()), client.proxy().replica_set_name());
}

#[test]
fn only_foreign_members_is_a_mismatch() {
    let cluster = Cluster::new();
    cluster.primary("wrong:27017", "other", &["wrong:27017"]);

    let client = client(&cluster, &["wrong:27017"], Some("rs0"));
    let wrong = client.instances()[0].clone();

    let err = client.connect(&ReadPreference::primary()).unwrap_err();
    let mismatch = err.causes().iter().any(|&(_, ref cause)| match **cause {
        Error::TopologyMismatch(_) => true,
        _ => false,
    });
    assert!(mismatch, "expected a topology mismatch among {:?}", err.causes());
    match *wrong.connect_error().unwrap() {
        Error::TopologyMismatch(_) => {}
        ref other => panic!("expected a topology mismatch, got {:?}", other),
    }

    let err = client.connect(&ReadPreference::primary()).unwrap_err();
    assert!(err.to_string().contains("with the name 'rs0'"), "unexpected error: {}", err);
}

#[test]
fn losing_the_primary_leaves_a_subset() {
    let cluster = Cluster::new();
    cluster.primary("rs-a:27017", "rs0", &["rs-a:27017", "rs-b:27017"]);
    cluster.secondary("rs-b:27017", "rs0", "rs-a:27017", &["rs-a:27017", "rs-b:27017"]);
    let client = client(&cluster, &["rs-a:27017", "rs-b:27017"], None);

    client.connect(&ReadPreference::primary()).unwrap();
    assert!(mock::eventually(|| replica_set(&client).connected_instances().len() == 2));

    cluster.set_up("rs-a:27017", false);
    client.verify_state().unwrap();

    assert!(mock::eventually(|| client.proxy().primary().is_none()));
    assert!(mock::eventually(|| client.state() == ProxyState::ConnectedToSubset));
    assert_eq!(1, replica_set(&client).connected_instances().len());
}

#[test]
fn disconnect_stops_every_member() {
    let cluster = Cluster::new();
    three_members(&cluster);
    let client = client(&cluster, &["rs-a:27017"], None);

    client.connect(&ReadPreference::primary()).unwrap();
    assert!(mock::eventually(|| replica_set(&client).connected_instances().len() == 3));

    client.disconnect();
    assert_eq!(ProxyState::Disconnected, client.state());
    assert!(replica_set(&client).connected_instances().is_empty());
    for instance in client.instances() {
        assert_eq!(ServerState::Disconnected, instance.state());
    }
}

fn set_without_primary(cluster: &Cluster) {
    let members = ["rs-b:27017", "rs-c:27017"];
    cluster.orphan_secondary("rs-b:27017", "rs0", &members);
    cluster.orphan_secondary("rs-c:27017", "rs0", &members);
}

#[test]
fn secondaries_serve_reads_without_a_primary() {
    let cluster = Cluster::new();
    set_without_primary(&cluster);
    let client = client(&cluster, &["rs-b:27017", "rs-c:27017"], None);

    let secondary = client.choose_server_instance(&ReadPreference::new(ReadMode::Secondary, None)).unwrap();
    assert!(secondary.is_secondary());
    assert!(client.proxy().primary().is_none());
    assert_eq!(Some("rs0".to_owned()), client.proxy().replica_set_name());
}

#[test]
fn primary_read_without_a_primary_times_out() {
    let cluster = Cluster::new();
    set_without_primary(&cluster);
    let client = client(&cluster, &["rs-b:27017", "rs-c:27017"], None);

    let err = client.connect_timeout(Duration::from_millis(300), &ReadPreference::primary()).unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {:?}", err);

    let secondary = client.choose_server_instance(&ReadPreference::new(ReadMode::SecondaryPreferred, None))
        .unwrap();
    assert!(secondary.is_secondary());
}

#[test]
fn seed_alias_takes_the_address_the_server_reports() {
    let cluster = Cluster::new();
    let members = ["rs-a:27017", "rs-b:27017"];
    cluster.primary("rs-a:27017", "rs0", &members);
    cluster.secondary("rs-b:27017", "rs0", "rs-a:27017", &members);
    cluster.alias("alias:27017", "rs-a:27017");

    let client = client(&cluster, &["alias:27017", "rs-a:27017"], None);
    let seeds = client.instances();

    let primary = client.choose_server_instance(&ReadPreference::primary()).unwrap();
    assert_eq!(mock::address("rs-a:27017"), primary.address());

    assert!(mock::eventually(|| client.instances().len() == 2));
    assert_eq!(set_of(&["rs-a", "rs-b"]), hosts(&client));
    assert_eq!(1, seeds.iter().filter(|seed| seed.is_permanently_disconnected()).count());
}
