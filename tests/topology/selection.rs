use mock::{self, Cluster};

use mongodb_topology::common::{ReadMode, ReadPreference, ServerSelector};
use mongodb_topology::topology::ServerInstance;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn connect(cluster: &Cluster, host: &str) -> Arc<ServerInstance> {
    let instance = ServerInstance::new(mock::address(host), Arc::new(cluster.context(mock::settings(&[host]))));
    instance.connect().unwrap();
    instance
}

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect()
}

// A primary, two tagged secondaries and an arbiter, all equally fast.
fn replica_set() -> Vec<Arc<ServerInstance>> {
    let cluster = Cluster::new();
    cluster.primary("p:1", "rs0", &["p:1", "ny:1", "sf:1"]);
    cluster.add("ny:1",
                doc! {
                    "ok": 1, "ismaster": false, "secondary": true, "setName": "rs0",
                    "tags": { "dc": "ny", "rack": "1" }
                });
    cluster.add("sf:1",
                doc! {
                    "ok": 1, "ismaster": false, "secondary": true, "setName": "rs0",
                    "tags": { "dc": "sf" }
                });
    cluster.add("arb:1", doc! { "ok": 1, "ismaster": false, "arbiterOnly": true, "setName": "rs0" });

    ["p:1", "ny:1", "sf:1", "arb:1"].iter().map(|host| connect(&cluster, host)).collect()
}

fn host(instance: Option<Arc<ServerInstance>>) -> String {
    instance.map(|instance| instance.address().host).unwrap_or_default()
}

fn wide(pref: ReadPreference) -> ReadPreference {
    pref.with_acceptable_latency(Duration::from_secs(60))
}

#[test]
fn primary_and_secondary_modes() {
    let instances = replica_set();

    assert_eq!("p", host(wide(ReadPreference::primary()).choose(&instances)));
    for _ in 0..10 {
        let chosen = host(wide(ReadPreference::new(ReadMode::Secondary, None)).choose(&instances));
        assert!(chosen == "ny" || chosen == "sf", "chose {}", chosen);
        let nearest = host(wide(ReadPreference::nearest()).choose(&instances));
        assert!(nearest != "arb", "an arbiter was chosen");
    }
}

#[test]
fn preferred_modes_fall_back() {
    let instances = replica_set();
    let secondaries: Vec<_> = instances.iter().filter(|i| i.is_secondary()).cloned().collect();
    let primary_only: Vec<_> = instances.iter().filter(|i| i.is_primary()).cloned().collect();

    let chosen = host(wide(ReadPreference::new(ReadMode::PrimaryPreferred, None)).choose(&secondaries));
    assert!(chosen == "ny" || chosen == "sf");
    assert_eq!("p",
               host(wide(ReadPreference::new(ReadMode::SecondaryPreferred, None)).choose(&primary_only)));
    assert!(ReadPreference::new(ReadMode::Secondary, None).choose(&primary_only).is_none());
}

#[test]
fn first_matching_tag_set_wins() {
    let instances = replica_set();

    let pref = ReadPreference::new(ReadMode::Secondary,
                                   Some(vec![tags(&[("dc", "tokyo")]), tags(&[("dc", "sf")]), tags(&[])]));
    assert_eq!("sf", host(wide(pref).choose(&instances)));

    let pref = ReadPreference::new(ReadMode::Secondary, Some(vec![tags(&[("dc", "ny"), ("rack", "1")])]));
    assert_eq!("ny", host(wide(pref).choose(&instances)));

    let pref = ReadPreference::new(ReadMode::Secondary, Some(vec![tags(&[("dc", "tokyo")])]));
    assert!(pref.choose(&instances).is_none());
}

#[test]
fn latency_window_excludes_slow_instances() {
    let cluster = Cluster::new();
    cluster.router("fast:1");
    cluster.router("slow:1");
    cluster.set_latency("slow:1", Duration::from_millis(60));
    let instances = vec![connect(&cluster, "fast:1"), connect(&cluster, "slow:1")];

    let pref = ReadPreference::nearest().with_acceptable_latency(Duration::from_millis(15));
    for _ in 0..10 {
        assert_eq!("fast", host(pref.choose(&instances)));
    }
}
