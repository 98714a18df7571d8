//! End-to-end session scenarios over a scripted host: lazy discovery and
//! caching, fuzzy resolution, shadow preservation, event-driven
//! invalidation and error mapping.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::{
    command_id, command_name, discover_response, err_response, ok_response,
    transport_state_response, ScriptedHost, ScriptedReply,
};
use flbridge::{BridgeError, BridgeSession, PluginAddress, ShadowSource};
use flconf::BridgeConfig;
use flproto::chunk::encode_message;
use flproto::record::WireRecord;
use flproto::sysex::{MessageKind, Origin, Status};

/// A host with one Sytrus at channel 0 whose discovery dump carries two
/// named parameters (the reported 4240-slot table arrives pre-filtered).
/// Returns the session plus the discovery call counter.
async fn sytrus_session() -> (BridgeSession, Arc<AtomicUsize>, mpsc::Sender<Vec<u8>>) {
    let discoveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&discoveries);

    let (raw_tx, raw_rx) = mpsc::channel(256);
    let host = ScriptedHost::new(
        raw_tx.clone(),
        Box::new(move |record| {
            let id = command_id(record);
            let reply = match command_name(record) {
                "transport.state" => transport_state_response(id),
                "plugins.discover" => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    discover_response(id, "Sytrus", 0, &[(3, "Cutoff", 0.5), (7, "Resonance", 0.2)])
                }
                "plugins.set_param" => ok_response(id, json!({"read_back": null})),
                "plugins.get_param" => ok_response(id, json!({"value": 0.5})),
                _ => ok_response(id, json!({})),
            };
            vec![ScriptedReply::Respond(reply)]
        }),
    );

    let config = BridgeConfig {
        client_id: Some(0x19),
        ..BridgeConfig::default()
    };
    let session = BridgeSession::connect_over(Box::new(host), raw_rx, config)
        .await
        .expect("handshake succeeds");
    (session, discoveries, raw_tx)
}

#[tokio::test(start_paused = true)]
async fn discovery_runs_once_and_caches() {
    let (session, discoveries, _raw) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    let param = session.resolve_param(address, "cutoff").await.unwrap();
    assert_eq!((param.index, param.name.as_str(), param.value), (3, "Cutoff", 0.5));
    assert_eq!(discoveries.load(Ordering::Relaxed), 1);

    // Cache hit: no second discovery.
    let param = session.resolve_param(address, "Cutoff").await.unwrap();
    assert_eq!(param.index, 3);
    assert_eq!(discoveries.load(Ordering::Relaxed), 1);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fuzzy_resolution_tiers() {
    let (session, discoveries, _raw) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    // Prefix matches after one discovery.
    assert_eq!(session.resolve_param(address, "cut").await.unwrap().index, 3);
    assert_eq!(session.resolve_param(address, "reso").await.unwrap().index, 7);
    assert_eq!(discoveries.load(Ordering::Relaxed), 1);

    // A hopeless query re-discovers once, then reports absence.
    let err = session.resolve_param(address, "gain").await.unwrap_err();
    match err {
        BridgeError::ParameterNotFound { address: a, query } => {
            assert_eq!(a, address);
            assert_eq!(query, "gain");
        }
        other => panic!("expected ParameterNotFound, got {other}"),
    }
    assert_eq!(discoveries.load(Ordering::Relaxed), 2);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shadow_survives_rediscovery() {
    let (session, _discoveries, _raw) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    session.set_param(address, "cutoff", 0.9).await.unwrap();
    {
        let shadow = session.shadow().await;
        let entry = shadow.get(address, 3).unwrap();
        assert_eq!((entry.value, entry.source), (0.9, ShadowSource::User));
    }

    // Discovery reports 0.5 for the same slot; the user write stands.
    session.discover_plugin(address).await.unwrap();
    {
        let shadow = session.shadow().await;
        let entry = shadow.get(address, 3).unwrap();
        assert_eq!((entry.value, entry.source), (0.9, ShadowSource::User));
        // The untouched slot got seeded from discovery.
        let seeded = shadow.get(address, 7).unwrap();
        assert_eq!((seeded.value, seeded.source), (0.2, ShadowSource::Discovered));
    }

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn get_param_flags_divergence_from_shadow() {
    let (session, _discoveries, _raw) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    // Host always reads back 0.5; after writing 0.9 the reading diverges.
    session.set_param(address, "cutoff", 0.9).await.unwrap();
    let reading = session.get_param(address, "cutoff").await.unwrap();
    assert_eq!(reading.value, 0.5);
    assert_eq!(reading.shadow, Some(0.9));
    assert!(reading.diverged);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn set_param_clamps_to_unit_range() {
    let (session, _discoveries, _raw) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    session.set_param(address, "cutoff", 3.5).await.unwrap();
    assert_eq!(session.shadow().await.get(address, 3).unwrap().value, 1.0);

    session.set_param(address, "cutoff", -2.0).await.unwrap();
    assert_eq!(session.shadow().await.get(address, 3).unwrap().value, 0.0);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn plugin_changed_event_invalidates_directory_entry() {
    let (session, _discoveries, raw_tx) = sytrus_session().await;
    let address = PluginAddress::generator(0);

    session.resolve_param(address, "cutoff").await.unwrap();
    assert!(session.directory().await.contains(address));

    for frame in encode_message(
        Origin::Server,
        session.client_id(),
        MessageKind::Event,
        Status::Ok,
        &WireRecord::Event {
            name: "plugin_changed".into(),
            data: json!({"index": 0, "slot_index": -1}),
        },
        1800,
    )
    .unwrap()
    {
        raw_tx.send(frame).await.unwrap();
    }

    // The event listener runs asynchronously; poll briefly.
    let mut invalidated = false;
    for _ in 0..50 {
        if !session.directory().await.contains(address) {
            invalidated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(invalidated, "plugin_changed did not invalidate the entry");

    // The shadow ledger tracks the write history, not the schema.
    session.set_param(address, "cutoff", 0.4).await.unwrap();
    assert!(session.shadow().await.get(address, 3).is_some());

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn host_unsafe_write_is_surfaced_and_not_shadowed() {
    let (raw_tx, raw_rx) = mpsc::channel(256);
    let host = ScriptedHost::new(
        raw_tx,
        Box::new(|record| {
            let id = command_id(record);
            let reply = match command_name(record) {
                "transport.state" => transport_state_response(id),
                "plugins.discover" => {
                    discover_response(id, "Sytrus", 0, &[(3, "Cutoff", 0.5)])
                }
                "plugins.set_param" => err_response(id, "host_unsafe", "guards unset"),
                _ => ok_response(id, json!({})),
            };
            vec![ScriptedReply::Respond(reply)]
        }),
    );
    let session = BridgeSession::connect_over(Box::new(host), raw_rx, BridgeConfig::default())
        .await
        .unwrap();
    let address = PluginAddress::generator(0);

    let err = session.set_param(address, "cutoff", 0.8).await.unwrap_err();
    assert!(matches!(err, BridgeError::HostUnsafe(_)));
    assert!(err.is_retryable());

    // A refused write never reaches the ledger as a user write; only the
    // discovery seed is present.
    match session.shadow().await.get(address, 3) {
        Some(entry) => assert_eq!(entry.source, ShadowSource::Discovered),
        None => {}
    }

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_surfaces_and_stops_engine() {
    let (raw_tx, raw_rx) = mpsc::channel(256);
    let host = ScriptedHost::new(raw_tx, Box::new(|_| vec![ScriptedReply::Silence]));

    let config = BridgeConfig::default();
    let mut quick = config.clone();
    quick.timeouts.interactive_ms = 100;

    let started = tokio::time::Instant::now();
    let err = BridgeSession::connect_over(Box::new(host), raw_rx, quick)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    // Virtual clock: the handshake gave up at its 100 ms deadline, not a
    // heartbeat interval later.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn per_command_timeout_override_applies() {
    // transport.stop is overridden to 80 ms; the host needs 400 ms.
    let (raw_tx, raw_rx) = mpsc::channel(256);
    let host = ScriptedHost::new(
        raw_tx,
        Box::new(|record| {
            let id = command_id(record);
            match command_name(record) {
                "transport.state" => {
                    vec![ScriptedReply::Respond(transport_state_response(id))]
                }
                "transport.stop" => vec![ScriptedReply::RespondAfter(
                    Duration::from_millis(400),
                    ok_response(id, json!({})),
                )],
                _ => vec![ScriptedReply::Respond(ok_response(id, json!({})))],
            }
        }),
    );

    let mut config = BridgeConfig::default();
    config
        .timeouts
        .per_command
        .insert("transport.stop".to_string(), 80);

    let session = BridgeSession::connect_over(Box::new(host), raw_rx, config)
        .await
        .unwrap();

    let err = session.transport_stop().await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { command, .. } if command == "transport.stop"));

    // Caller-supplied timeout beats the override.
    session
        .execute_with(
            flproto::HostCommand::TransportStop,
            Some(Duration::from_secs(1)),
            None,
        )
        .await
        .unwrap();

    session.shutdown().await;
}
