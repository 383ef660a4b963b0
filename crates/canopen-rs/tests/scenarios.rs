//! End-to-end scenario tests driving two `LocalNode`s against each
//! other over the in-memory bus/clock doubles in `support`, covering the
//! six canonical exchanges: expedited and segmented SDO transfer,
//! block-mode download, Object Dictionary generation bumps, RPDO
//! inactivity timeout, and heartbeat-based peer supervision (both the
//! live-heartbeat and the timeout half), in the same end-to-end style as
//! `boot_up_test.rs`, adapted from a polled `run_cycle`/`VirtualNetwork`
//! pair to this crate's callback-driven `Bus`/`Clock`.

mod support;

use canopen_rs::nmt::NodeState;
use canopen_rs::od::OdValue;
use canopen_rs::pdo::PdoMappingEntry;
use canopen_rs::sdo::CompletionCallback;
use canopen_rs::types::Access;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use support::{make_node, pump};

const CLIENT: u8 = 10;
const SERVER: u8 = 5;

#[test]
fn s1_expedited_u32_read() {
    let (mut client, client_bus, client_clock) = make_node(CLIENT);
    let (mut server, server_bus, _server_clock) = make_node(SERVER);

    server.od.insert(0x2003, 3, Access::Ro, OdValue::U32(0x1122_3344)).unwrap();
    server.add_sdo_server(SERVER, CLIENT);
    // The read's landing site: the client's own OD at the same
    // coordinate, writable so the arriving value can be copied in.
    client.od.insert(0x2003, 3, Access::Rw, OdValue::U32(0)).unwrap();
    client.add_sdo_client(0, SERVER).unwrap();

    let result = Arc::new(AtomicU8::new(0));
    let result2 = result.clone();
    let callback: CompletionCallback = Box::new(move |status| {
        result2.store(if status.is_ok() { 1 } else { 2 }, Ordering::SeqCst);
    });
    client.read(SERVER, 0x2003, 3, Some(callback)).unwrap();
    pump(&mut client, &client_bus, &mut server, &server_bus);

    assert_eq!(result.load(Ordering::SeqCst), 1, "expedited read should complete successfully");
    assert_eq!(client.od.get_u32(0x2003, 3).unwrap(), 0x1122_3344);
    assert_eq!(client_clock.now(), 0, "expedited exchange needs no timer to fire");
}

#[test]
fn s2_segmented_string_write() {
    let (mut client, client_bus, _client_clock) = make_node(CLIENT);
    let (mut server, server_bus, _server_clock) = make_node(SERVER);

    let payload = "The quick brown fox jumps over the lazy dog";
    assert_eq!(payload.len(), 43);
    client.od.insert(0x2022, 0, Access::Rw, OdValue::Str(payload.into())).unwrap();
    server.od.insert(0x2022, 0, Access::Rw, OdValue::Str(String::new())).unwrap();
    server.add_sdo_server(SERVER, CLIENT);
    client.add_sdo_client(0, SERVER).unwrap();

    let result = Arc::new(AtomicU8::new(0));
    let result2 = result.clone();
    let callback: CompletionCallback = Box::new(move |status| {
        result2.store(if status.is_ok() { 1 } else { 2 }, Ordering::SeqCst);
    });
    client.write(SERVER, 0x2022, 0, Some(callback)).unwrap();
    pump(&mut client, &client_bus, &mut server, &server_bus);

    assert_eq!(result.load(Ordering::SeqCst), 1, "segmented write should complete successfully");
    let written = server.od.get_raw(0x2022, 0).unwrap();
    match written {
        OdValue::Str(s) => assert_eq!(s, payload),
        other => panic!("expected a string value, got {:?}", other),
    }
}

#[test]
fn s3_block_mode_download() {
    let (mut client, client_bus, _client_clock) = make_node(CLIENT);
    let (mut server, server_bus, _server_clock) = make_node(SERVER);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    client.od.insert(0x2022, 0, Access::Rw, OdValue::Buffer(canopen_rs::od::OdBuffer(payload.clone()))).unwrap();
    server.od.insert(0x2022, 0, Access::Rw, OdValue::Buffer(canopen_rs::od::OdBuffer(vec![0u8; 1000]))).unwrap();
    server.add_sdo_server(SERVER, CLIENT);
    client.add_sdo_client(0, SERVER).unwrap();

    let result = Arc::new(AtomicU8::new(0));
    let result2 = result.clone();
    let callback: CompletionCallback = Box::new(move |status| {
        result2.store(if status.is_ok() { 1 } else { 2 }, Ordering::SeqCst);
    });
    client.write(SERVER, 0x2022, 0, Some(callback)).unwrap();
    pump(&mut client, &client_bus, &mut server, &server_bus);

    assert_eq!(result.load(Ordering::SeqCst), 1, "block-mode download should complete successfully");
    let written = server.od.get_raw(0x2022, 0).unwrap();
    match written {
        OdValue::Buffer(buf) => assert_eq!(buf.0, payload),
        other => panic!("expected a buffer value, got {:?}", other),
    }
}

#[test]
fn s4_generation_bumps_on_every_write_even_with_the_same_value() {
    let (mut node, _bus, _clock) = make_node(SERVER);
    node.od.insert(0x2000, 0, Access::Rw, OdValue::U8(42)).unwrap();
    let g0 = node.od.generation(0x2000, 0).unwrap();

    node.od.set_u8(0x2000, 0, 43).unwrap();
    let g1 = node.od.generation(0x2000, 0).unwrap();
    assert_ne!(g0, g1);

    node.od.set_u8(0x2000, 0, 43).unwrap();
    let g2 = node.od.generation(0x2000, 0).unwrap();
    assert_ne!(g1, g2, "generation must bump on every set, even a value-equal one");
}

#[test]
fn s5_rpdo_inactivity_timeout_fires_exactly_once() {
    let (mut node, _bus, clock) = make_node(SERVER);
    node.set_state(NodeState::Operational);

    let fired = Arc::new(AtomicU8::new(0));
    let fired2 = fired.clone();
    let seen_cobid = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let seen_cobid2 = seen_cobid.clone();
    let timeout_cb: Box<dyn FnMut(u32) + Send> = Box::new(move |cobid| {
        fired2.fetch_add(1, Ordering::SeqCst);
        seen_cobid2.store(cobid, Ordering::SeqCst);
    });
    let mapping = [PdoMappingEntry { index: 0x6000, sub_index: 1, bit_length: 16 }];
    node.od.insert(0x6000, 1, Access::Rw, OdValue::U16(0)).unwrap();
    node.add_rpdo(1, 0x201, &mapping, 50, Some(timeout_cb)).unwrap();

    clock.advance(60);

    assert_eq!(fired.load(Ordering::SeqCst), 1, "timeout callback must fire exactly once");
    assert_eq!(seen_cobid.load(Ordering::SeqCst), 0x201);
}

#[test]
fn s6_heartbeat_supervision_tracks_peer_state_and_offline_timeout() {
    let (mut node, _bus, clock) = make_node(SERVER);

    let last_state = Arc::new(AtomicU8::new(NodeState::Offline as u8));
    let notifications = Arc::new(AtomicU8::new(0));
    let last_state2 = last_state.clone();
    let notifications2 = notifications.clone();
    node.register_remote_state_cb(
        CLIENT,
        Box::new(move |_node, state| {
            last_state2.store(state as u8, Ordering::SeqCst);
            notifications2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    node.set_remote_timeout(CLIENT, 100).unwrap();

    let heartbeat = canopen_rs::types::Msg::new(canopen_rs::types::cob::heartbeat(CLIENT), &[NodeState::Operational as u8]);
    node.process_frame(&heartbeat);
    assert_eq!(node.remote_state(CLIENT), Some(NodeState::Operational));
    assert_eq!(last_state.load(Ordering::SeqCst), NodeState::Operational as u8);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    clock.advance(100);

    assert_eq!(node.remote_state(CLIENT), Some(NodeState::Offline), "peer must be marked offline once its heartbeat times out");
    assert_eq!(last_state.load(Ordering::SeqCst), NodeState::Offline as u8);
    assert_eq!(notifications.load(Ordering::SeqCst), 2, "offline transition must notify subscribers exactly once");
}
