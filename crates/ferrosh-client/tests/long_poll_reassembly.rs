//! Fragment reassembly across long-poll boundaries: the endpoint splits a
//! PIPELINE_OUTPUT message's fragment bytes in half and delivers the halves
//! in separate Receive responses; exactly one record must come out.

mod support;

use std::sync::{Arc, Mutex};

use ferrosh_client::{AuthConfig, AuthScheme, Client, ClientConfig, Credentials, Endpoint};
use support::{SimOptions, WsmanSim, start_sim};

#[tokio::test]
async fn split_fragments_reassemble_into_one_message() {
    let payload = "reassembled-across-two-receives".to_owned();
    let sim = Arc::new(Mutex::new(WsmanSim::new(
        vec![payload.clone()],
        SimOptions {
            max_chunks_per_receive: 1,
            split_fragment_bytes: true,
            ..SimOptions::default()
        },
    )));
    let addr = start_sim(Arc::clone(&sim)).await;

    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port(), false).expect("endpoint");
    let auth = AuthConfig::new(AuthScheme::Basic, Credentials::new("user", "password"));
    let mut client = Client::new(endpoint, auth, ClientConfig::default()).expect("client");

    client.connect().await.expect("connect");
    let result = client.execute("Get-Payload").await.expect("execute");

    assert_eq!(result.output, vec![payload]);
    assert!(!result.had_errors);

    client.close().await.expect("close");

    // Every queued message was halved and served one chunk per Receive, so
    // the dispatch loop must have polled repeatedly.
    let receives = sim
        .lock()
        .unwrap()
        .requests_seen
        .iter()
        .filter(|a| a.as_str() == "Receive")
        .count();
    assert!(receives >= 2, "expected several Receive polls, saw {receives}");
}

#[tokio::test]
async fn stop_signals_terminate_and_reports_stopped() {
    // No outputs queued: the pipeline stays "running" until signalled.
    let sim = Arc::new(Mutex::new(WsmanSim::new(
        Vec::new(),
        SimOptions {
            hold_pipeline_output_until_reconnect: true, // parks the state msg
            ..SimOptions::default()
        },
    )));
    let addr = start_sim(Arc::clone(&sim)).await;

    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port(), false).expect("endpoint");
    let auth = AuthConfig::new(AuthScheme::Basic, Credentials::new("user", "password"));
    let mut client = Client::new(endpoint, auth, ClientConfig::default()).expect("client");

    client.connect().await.expect("connect");

    let handle = client
        .execute_async("Start-Sleep -Seconds 60")
        .await
        .expect("start");

    client.stop(handle).await.expect("stop");

    let result = client.wait_pipeline(handle).await.expect("collect");
    assert_eq!(result.state, ferrosh_psrp::PipelineStateValue::Stopped);

    client.close().await.expect("close");

    let seen = sim.lock().unwrap().requests_seen.clone();
    assert!(seen.contains(&"Signal".to_owned()));
}
