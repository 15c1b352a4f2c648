//! Disconnect/reconnect with session persistence: output produced while the
//! client was away is recovered by a brand-new client instance that loads
//! the saved session state.

mod support;

use std::sync::{Arc, Mutex};

use ferrosh_client::{
    AuthConfig, AuthScheme, Client, ClientConfig, Credentials, Endpoint,
};
use support::{SimOptions, WsmanSim, start_sim};

fn client_for(addr: std::net::SocketAddr) -> Client {
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port(), false).expect("endpoint");
    let auth = AuthConfig::new(AuthScheme::Basic, Credentials::new("user", "password"));
    Client::new(endpoint, auth, ClientConfig::default()).expect("client")
}

#[tokio::test]
async fn disconnect_save_reconnect_recovers_output() {
    let sim = Arc::new(Mutex::new(WsmanSim::new(
        vec!["produced-while-away".to_owned()],
        SimOptions {
            hold_pipeline_output_until_reconnect: true,
            ..SimOptions::default()
        },
    )));
    let addr = start_sim(Arc::clone(&sim)).await;

    let state_dir = std::env::temp_dir().join(format!("ferrosh-reconnect-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&state_dir).unwrap();
    let state_path = state_dir.join("session.json");

    // First client: open, start a long-running pipeline, detach.
    let mut first = client_for(addr);
    first.connect().await.expect("connect");
    let handle = first
        .execute_async("Start-Sleep 10; 'produced-while-away'")
        .await
        .expect("start pipeline");

    let state = first.disconnect().await.expect("disconnect");
    assert!(state.pipeline_ids.contains(&handle.id()));
    state.save(&state_path).expect("save state");
    drop(first);

    // Second client (fresh process in spirit): load, reconnect, recover.
    let loaded = Client::load_state(&state_path).expect("load state");
    assert_eq!(loaded.shell_id, state.shell_id);
    assert_eq!(loaded.auth_kind, "Basic");

    let mut second = client_for(addr);
    let snapshot = second
        .reconnect_session(&loaded)
        .await
        .expect("reconnect");
    assert!(snapshot.state.is_open());

    let result = second
        .wait_pipeline(handle)
        .await
        .expect("recover pipeline output");
    assert_eq!(result.output, vec!["produced-while-away".to_owned()]);
    assert_eq!(
        result.state,
        ferrosh_psrp::PipelineStateValue::Completed
    );

    second.close().await.expect("close");
    std::fs::remove_dir_all(&state_dir).ok();

    let seen = sim.lock().unwrap().requests_seen.clone();
    assert!(seen.contains(&"Disconnect".to_owned()));
    assert!(seen.contains(&"Reconnect".to_owned()));
}

#[tokio::test]
async fn list_and_remove_disconnected_shells() {
    let sim = Arc::new(Mutex::new(WsmanSim::new(
        Vec::new(),
        SimOptions::default(),
    )));
    let addr = start_sim(Arc::clone(&sim)).await;

    let mut client = client_for(addr);
    client.connect().await.expect("connect");
    let state = client.disconnect().await.expect("disconnect");

    let probe = client_for(addr);
    let disconnected = probe.list_disconnected().await.expect("enumerate");
    assert_eq!(disconnected, vec![state.shell_id]);

    probe
        .remove_disconnected(state.shell_id)
        .await
        .expect("delete shell");

    let seen = sim.lock().unwrap().requests_seen.clone();
    assert!(seen.contains(&"Enumerate".to_owned()));
    assert!(seen.contains(&"Delete".to_owned()));
}
