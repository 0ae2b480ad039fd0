//! End-to-end flow over the TCP line protocol: hello handshake, admin
//! slot management, candidate booking and cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;

use slotd::engine::{Engine, EngineTuning};
use slotd::facade::BookingFacade;
use slotd::notify::{LogMailer, NotifyHub};
use slotd::wire::{self, AppState};

const TOKEN: &str = "integration-test-token";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_wire");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn start_server(name: &str) -> std::net::SocketAddr {
    let engine = Arc::new(
        Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), EngineTuning::default())
            .unwrap(),
    );
    let state = Arc::new(AppState {
        facade: BookingFacade::new(engine, Arc::new(LogMailer)),
        token: TOKEN.into(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(wire::serve(listener, state, 16, std::future::pending::<()>()));
    addr
}

struct Client {
    lines: Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and complete the hello handshake, returning the hello reply.
    async fn connect(addr: std::net::SocketAddr, token: &str, role: &str) -> (Self, Value) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let lines = BufReader::new(read).lines();
        let mut client = Client { lines, writer };
        let actor_id = ulid::Ulid::new().to_string();
        let reply = client
            .send(json!({ "token": token, "actor_id": actor_id, "role": role }))
            .await;
        (client, reply)
    }

    async fn send(&mut self, frame: Value) -> Value {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }
}

fn hours_from_now(h: i64) -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    now + h * 3_600_000
}

#[tokio::test]
async fn bad_token_is_rejected_before_any_request() {
    let addr = start_server("bad_token.wal").await;
    let (_client, reply) = Client::connect(addr, "wrong-token", "candidate").await;
    assert_eq!(reply["reply"], "error");
}

#[tokio::test]
async fn full_booking_flow_over_the_wire() {
    let addr = start_server("full_flow.wal").await;

    let (mut admin, hello) = Client::connect(addr, TOKEN, "admin").await;
    assert_eq!(hello["reply"], "hello");
    assert_eq!(hello["role"], "admin");

    let created = admin
        .send(json!({
            "op": "create_slot",
            "start": hours_from_now(48),
            "end": hours_from_now(49),
            "capacity": 1,
            "location": { "mode": "on_site", "room": "C-301" }
        }))
        .await;
    assert_eq!(created["reply"], "slot_created");
    let slot_id = created["slot_id"].as_str().unwrap().to_owned();

    let (mut candidate, hello) = Client::connect(addr, TOKEN, "candidate").await;
    assert_eq!(hello["role"], "candidate");

    let slots = candidate.send(json!({ "op": "list_slots" })).await;
    assert_eq!(slots["reply"], "slots");
    assert_eq!(slots["slots"].as_array().unwrap().len(), 1);
    assert_eq!(slots["slots"][0]["remaining"], 1);

    let booked = candidate
        .send(json!({ "op": "book", "slot_id": slot_id }))
        .await;
    assert_eq!(booked["reply"], "booked");
    let booking_id = booked["booking"]["id"].as_str().unwrap().to_owned();

    let mine = candidate.send(json!({ "op": "my_booking" })).await;
    assert_eq!(mine["booking"]["id"].as_str().unwrap(), booking_id);

    // Second attempt by the same candidate is a duplicate.
    let dup = candidate
        .send(json!({ "op": "book", "slot_id": slot_id }))
        .await;
    assert_eq!(dup["reply"], "rejected");
    assert_eq!(dup["reason"]["kind"], "duplicate_booking");

    // A different candidate finds the slot full.
    let (mut rival, _) = Client::connect(addr, TOKEN, "candidate").await;
    let full = rival.send(json!({ "op": "book", "slot_id": slot_id })).await;
    assert_eq!(full["reason"]["kind"], "slot_full");

    // Cancellation 48h out is within the cutoff window.
    let cancelled = candidate
        .send(json!({ "op": "cancel", "booking_id": booking_id }))
        .await;
    assert_eq!(cancelled["reply"], "cancelled");

    let again = candidate
        .send(json!({ "op": "cancel", "booking_id": booking_id }))
        .await;
    assert_eq!(again["reason"]["kind"], "already_cancelled");

    // The freed place is bookable again.
    let rebooked = rival.send(json!({ "op": "book", "slot_id": slot_id })).await;
    assert_eq!(rebooked["reply"], "booked");
}

#[tokio::test]
async fn candidates_cannot_manage_slots() {
    let addr = start_server("forbidden_ops.wal").await;
    let (mut candidate, _) = Client::connect(addr, TOKEN, "candidate").await;

    let reply = candidate
        .send(json!({
            "op": "create_slot",
            "start": hours_from_now(48),
            "end": hours_from_now(49),
            "capacity": 2,
            "location": { "mode": "remote" }
        }))
        .await;
    assert_eq!(reply["reply"], "rejected");
    assert_eq!(reply["reason"]["kind"], "forbidden");

    let reply = candidate
        .send(json!({ "op": "delete_slot", "slot_id": ulid::Ulid::new().to_string() }))
        .await;
    assert_eq!(reply["reason"]["kind"], "forbidden");
}

#[tokio::test]
async fn series_creation_and_snapshot() {
    let addr = start_server("series_flow.wal").await;
    let (mut admin, _) = Client::connect(addr, TOKEN, "admin").await;

    let reply = admin
        .send(json!({
            "op": "create_slot_series",
            "start": hours_from_now(48),
            "end": hours_from_now(50),
            "interval_ms": 30 * 60_000,
            "capacity": 2,
            "location": { "mode": "remote" }
        }))
        .await;
    assert_eq!(reply["reply"], "series_created");
    assert_eq!(reply["slot_ids"].as_array().unwrap().len(), 4);
    assert_eq!(reply["skipped"], 0);

    let snapshot = admin.send(json!({ "op": "snapshot" })).await;
    let entries = snapshot["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e["remaining"] == 2 && e["is_full"] == false));
}

#[tokio::test]
async fn malformed_request_gets_an_error_not_a_disconnect() {
    let addr = start_server("malformed.wal").await;
    let (mut client, _) = Client::connect(addr, TOKEN, "candidate").await;

    let reply = client.send(json!({ "op": "no_such_op" })).await;
    assert_eq!(reply["reply"], "error");

    // The connection is still usable afterwards.
    let slots = client.send(json!({ "op": "list_slots" })).await;
    assert_eq!(slots["reply"], "slots");
}
