use mock::{self, Cluster};

use mongodb_topology::Client;
use mongodb_topology::apm::ServerEvent;
use mongodb_topology::common::ReadPreference;
use mongodb_topology::settings::ConnectionMode;
use mongodb_topology::topology::{ProxyState, ServerState};

use std::sync::{Arc, Mutex};

fn record(client: &Client) -> Arc<Mutex<Vec<ServerEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.add_event_hook(move |event: &ServerEvent| sink.lock().unwrap().push(event.clone())).unwrap();
    events
}

fn instance_states(events: &Arc<Mutex<Vec<ServerEvent>>>) -> Vec<ServerState> {
    events.lock()
        .unwrap()
        .iter()
        .filter_map(|event| match *event {
            ServerEvent::InstanceStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect()
}

#[test]
fn instance_lifecycle_is_reported() {
    let cluster = Cluster::new();
    cluster.standalone("solo:27017");
    let client = Client::with_context(cluster.context(mock::settings(&["solo:27017"]))).unwrap();
    let events = record(&client);

    client.connect(&ReadPreference::primary()).unwrap();
    assert_eq!(vec![ServerState::Connecting, ServerState::Connected], instance_states(&events));
    assert!(events.lock().unwrap().iter().any(|event| match *event {
        ServerEvent::PingTimeChanged { ref address, .. } => *address == mock::address("solo:27017"),
        _ => false,
    }));

    client.disconnect();
    assert_eq!(vec![ServerState::Connecting,
                    ServerState::Connected,
                    ServerState::Disconnecting,
                    ServerState::Disconnected],
               instance_states(&events));
    assert!(events.lock().unwrap().iter().any(|event| match *event {
        ServerEvent::PoolCleared { generation, .. } => generation == 1,
        _ => false,
    }));
}

#[test]
fn proxy_transitions_are_reported() {
    let cluster = Cluster::new();
    cluster.router("mongos-a:27017");
    let mut settings = mock::settings(&["mongos-a:27017"]);
    settings.connection_mode = ConnectionMode::ShardRouter;
    let client = Client::with_context(cluster.context(settings)).unwrap();
    let events = record(&client);

    client.connect(&ReadPreference::nearest()).unwrap();
    let connected = || {
        events.lock().unwrap().iter().any(|event| *event == ServerEvent::ProxyStateChanged { state: ProxyState::Connected })
    };
    assert!(mock::eventually(connected));

    client.disconnect();
    let last_proxy_state = events.lock()
        .unwrap()
        .iter()
        .filter_map(|event| match *event {
            ServerEvent::ProxyStateChanged { state } => Some(state),
            _ => None,
        })
        .last();
    assert_eq!(Some(ProxyState::Disconnected), last_proxy_state);
}

#[test]
fn events_render_for_logs() {
    let event = ServerEvent::InstanceStateChanged {
        address: mock::address("solo:27017"),
        state: ServerState::Connected,
    };
    assert_eq!("INSTANCE solo:27017 STATE: Connected", event.to_string());
}
