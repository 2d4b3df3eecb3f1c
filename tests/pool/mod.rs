use mock::{self, Cluster, CountingAuthenticator};

use mongodb_topology::Error;
use mongodb_topology::auth::{AuthContext, MongoCredentials};
use mongodb_topology::pool::AcquireOptions;
use mongodb_topology::settings::ServerSettings;
use mongodb_topology::topology::{ServerInstance, ServerState};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn connected(cluster: &Cluster, settings: ServerSettings) -> Arc<ServerInstance> {
    let instance = ServerInstance::new(settings.hosts[0].clone(), Arc::new(cluster.context(settings)));
    instance.connect().unwrap();
    assert_eq!(ServerState::Connected, instance.state());
    instance
}

fn single(max: usize) -> (Cluster, ServerSettings) {
    let cluster = Cluster::new();
    cluster.standalone("pool:27017");
    let mut settings = mock::settings(&["pool:27017"]);
    settings.max_connection_pool_size = max;
    (cluster, settings)
}

#[test]
fn never_exceeds_max_size() {
    let (cluster, settings) = single(3);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    let held: Vec<_> = (0..3).map(|_| pool.acquire(None, &AcquireOptions::default()).unwrap()).collect();
    assert_eq!(3, pool.pool_size());
    assert_eq!(0, pool.available_connections_count());

    let err = pool.acquire(None, &AcquireOptions::with_timeout(Duration::from_millis(0))).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(3, pool.pool_size());

    for connection in held {
        pool.release(connection).unwrap();
    }
    assert_eq!(3, pool.available_connections_count());
    assert!(pool.available_connections_count() <= pool.pool_size());
    assert_eq!(3, cluster.opened());
}

#[test]
fn single_slot_times_out_while_held() {
    let (cluster, settings) = single(1);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    let held = pool.acquire(None, &AcquireOptions::default()).unwrap();
    match pool.acquire(None, &AcquireOptions::with_timeout(Duration::from_millis(0))) {
        Err(Error::ConnectionTimeout(_)) => {}
        other => panic!("expected a timeout, got {:?}", other.map(|c| c.id())),
    }

    pool.release(held).unwrap();
    assert!(pool.acquire(None, &AcquireOptions::with_timeout(Duration::from_millis(0))).is_ok());
}

#[test]
fn waiter_receives_released_connection() {
    let (cluster, settings) = single(1);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool().clone();

    let held = pool.acquire(None, &AcquireOptions::default()).unwrap();
    let held_id = held.id();

    let waiter_pool = pool.clone();
    let waiter = thread::spawn(move || {
        waiter_pool.acquire(None, &AcquireOptions::with_timeout(Duration::from_secs(2))).map(|c| c.id())
    });

    assert!(mock::eventually(|| pool.wait_queue_size() == 1));
    pool.release(held).unwrap();

    assert_eq!(held_id, waiter.join().unwrap().unwrap());
}

#[test]
fn full_wait_queue_is_rejected() {
    let (cluster, mut settings) = single(1);
    settings.wait_queue_size = 1;
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool().clone();

    let held = pool.acquire(None, &AcquireOptions::default()).unwrap();

    let waiter_pool = pool.clone();
    let waiter = thread::spawn(move || {
        waiter_pool.acquire(None, &AcquireOptions::with_timeout(Duration::from_secs(2))).is_ok()
    });
    assert!(mock::eventually(|| pool.wait_queue_size() == 1));

    match pool.acquire(None, &AcquireOptions::default()) {
        Err(Error::PoolExhausted(_)) => {}
        other => panic!("expected the wait queue to be full, got {:?}", other.map(|c| c.id())),
    }

    pool.release(held).unwrap();
    assert!(waiter.join().unwrap());
}

#[test]
fn clear_invalidates_checked_out_connections() {
    let (cluster, settings) = single(2);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    let before = pool.generation_id();
    let connection = pool.acquire(None, &AcquireOptions::default()).unwrap();
    assert_eq!(before, connection.generation_id());

    pool.clear();
    assert_eq!(before + 1, pool.generation_id());
    assert_eq!(0, pool.pool_size());

    pool.release(connection).unwrap();
    assert_eq!(0, pool.available_connections_count());
    assert_eq!(0, pool.pool_size());

    let fresh = pool.acquire(None, &AcquireOptions::default()).unwrap();
    assert_eq!(before + 1, fresh.generation_id());
    assert_eq!(1, pool.pool_size());
}

#[test]
fn failed_open_frees_its_slot() {
    let (cluster, settings) = single(1);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    pool.clear();
    cluster.set_up("pool:27017", false);
    assert!(pool.acquire(None, &AcquireOptions::default()).is_err());
    assert_eq!(0, pool.pool_size());

    cluster.set_up("pool:27017", true);
    assert!(pool.acquire(None, &AcquireOptions::default()).is_ok());
}

#[test]
fn releasing_to_another_pool_is_an_error() {
    let (cluster, settings) = single(2);
    let first = connected(&cluster, settings.clone());
    let second = connected(&cluster, settings);

    let connection = first.connection_pool().acquire(None, &AcquireOptions::default()).unwrap();
    match second.connection_pool().release(connection) {
        Err(Error::ArgumentError(_)) => {}
        other => panic!("expected an argument error, got {:?}", other),
    }
}

#[test]
fn at_most_one_lifetime_eviction_per_tick() {
    let (cluster, mut settings) = single(4);
    settings.max_connection_life_time = Duration::from_millis(50);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();
    pool.maintain();

    let first = pool.acquire(None, &AcquireOptions::default()).unwrap();
    let second = pool.acquire(None, &AcquireOptions::default()).unwrap();
    let size = pool.pool_size();
    let available = pool.available_connections_count();

    thread::sleep(Duration::from_millis(80));
    pool.release(first).unwrap();
    pool.release(second).unwrap();

    assert_eq!(size - 1, pool.pool_size());
    assert_eq!(available + 1, pool.available_connections_count());
}

#[test]
fn maintenance_evicts_idle_connections_one_at_a_time() {
    let (cluster, mut settings) = single(4);
    settings.max_connection_idle_time = Duration::from_millis(30);
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    let held: Vec<_> = (0..3).map(|_| pool.acquire(None, &AcquireOptions::default()).unwrap()).collect();
    for connection in held {
        pool.release(connection).unwrap();
    }
    assert_eq!(3, pool.available_connections_count());

    thread::sleep(Duration::from_millis(60));
    pool.maintain();
    assert_eq!(2, pool.available_connections_count());
    assert_eq!(2, pool.pool_size());
}

#[test]
fn maintenance_tops_up_to_minimum() {
    let (cluster, mut settings) = single(5);
    settings.min_connection_pool_size = 3;
    let instance = connected(&cluster, settings);
    let pool = instance.connection_pool();

    pool.maintain();
    assert!(mock::eventually(|| pool.pool_size() == 3 && pool.available_connections_count() == 3));
}

#[test]
fn maintenance_recovers_a_disconnected_instance() {
    let (cluster, settings) = single(2);
    let instance = connected(&cluster, settings);

    cluster.set_up("pool:27017", false);
    assert!(instance.verify_state().is_err());
    assert_eq!(ServerState::Disconnected, instance.state());
    assert!(instance.connect_error().is_some());

    cluster.set_up("pool:27017", true);
    instance.connection_pool().maintain();
    assert_eq!(ServerState::Connected, instance.state());
}

#[test]
fn maintenance_timer_stops_on_disconnect() {
    let (cluster, settings) = single(2);
    let instance = connected(&cluster, settings);
    assert!(instance.connection_pool().is_maintenance_running());

    instance.disconnect();
    assert!(!instance.connection_pool().is_maintenance_running());
    assert_eq!(ServerState::Disconnected, instance.state());
}

#[test]
fn unfit_idle_connection_is_replaced_at_capacity() {
    let (cluster, settings) = single(1);
    let context = cluster.context(settings).with_authenticator(CountingAuthenticator::default());
    let instance = ServerInstance::new(mock::address("pool:27017"), Arc::new(context));
    instance.connect().unwrap();

    let alice = AuthContext::new("test", Some(MongoCredentials::new("alice", "password", false)));
    let bob = AuthContext::new("test", Some(MongoCredentials::new("bob", "password", false)));

    let connection = instance.acquire_connection(Some(&alice)).unwrap();
    let alice_id = connection.id();
    instance.release_connection(connection).unwrap();

    let connection = instance.acquire_connection(Some(&bob)).unwrap();
    assert!(connection.id() != alice_id);
    assert!(connection.is_authenticated(Some(&bob)).unwrap());

    let pool = instance.connection_pool();
    assert_eq!(1, pool.pool_size());
    assert_eq!(0, pool.available_connections_count());
}
