//! End-to-end pipeline tests.
//!
//! Each test boots the full router on an ephemeral port with an in-memory
//! store and short relay deadlines, then drives it with `reqwest` plus a
//! fake agent that speaks the real protocol: long-poll `/relay/recv` on its
//! inbox, store/serve/delete chunks from a map, ack stores on
//! `server`/`ack-<chunk_id>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;

use scatter_core::chunking::chunk_id;
use scatter_core::envelope::{RelayCommand, RelayMessage};

use crate::backend::cloud::CloudDrive;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::relay::{Relay, RelayConfig};
use crate::state::AppState;

fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        capacity: 10,
        send_timeout: Duration::from_millis(500),
        recv_timeout: Duration::from_millis(300),
        sweep_after: Duration::from_secs(5),
        ack_timeout: Duration::from_millis(600),
        retrieve_timeout: Duration::from_millis(600),
    }
}

async fn start_server() -> (String, AppState) {
    let db = Database::open(None).unwrap();
    let relay = Relay::new(fast_relay_config());
    let cloud = CloudDrive::new(db.clone(), None, None);
    let state = AppState::new(db, relay, cloud, ServerConfig::default());

    let app = crate::build_router(state.clone(), 64 * 1024 * 1024);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("http://{addr}"), state)
}

type ChunkMap = Arc<DashMap<String, Vec<u8>>>;

/// A minimal agent: polls its inbox and handles STORE/RETRIEVE/DELETE.
/// `acks` controls whether STOREs are acknowledged; a non-acking agent
/// simulates a device that accepts commands but never confirms.
fn spawn_agent(base: String, device_id: String, store: ChunkMap, acks: bool) {
    tokio::spawn(async move {
        let client = Client::new();
        loop {
            let resp = client
                .get(format!("{base}/relay/recv"))
                .query(&[("me", device_id.as_str()), ("session", "inbox")])
                .send()
                .await;
            let Ok(resp) = resp else { break };
            if !resp.status().is_success() {
                continue; // poll timeout, go around
            }
            let Ok(bytes) = resp.bytes().await else { continue };
            let Ok(msg) = RelayMessage::from_bytes(&bytes) else { continue };

            match msg.command {
                RelayCommand::Store => {
                    let id = chunk_id(&msg.payload);
                    store.insert(id.clone(), msg.payload);
                    if acks {
                        let _ = client
                            .post(format!("{base}/relay/send"))
                            .query(&[("to", "server".to_string()), ("session", format!("ack-{id}"))])
                            .body("ok")
                            .send()
                            .await;
                    }
                }
                RelayCommand::Retrieve => {
                    let id = String::from_utf8_lossy(&msg.payload).to_string();
                    if let Some(data) = store.get(&id).map(|entry| entry.clone()) {
                        let _ = client
                            .post(format!("{base}/relay/send"))
                            .query(&[("to", "server".to_string()), ("session", format!("chunk-{id}"))])
                            .body(data)
                            .send()
                            .await;
                    }
                }
                RelayCommand::Delete => {
                    let id = String::from_utf8_lossy(&msg.payload).to_string();
                    store.remove(&id);
                }
            }
        }
    });
}

/// Sign up, log in, and return the session cookie to send back.
async fn login(client: &Client, base: &str) -> String {
    let creds = serde_json::json!({ "email": "user@test", "password": "pw" });
    let resp = client
        .post(format!("{base}/api/signup"))
        .json(&creds)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = client
        .post(format!("{base}/api/login"))
        .json(&creds)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let set_cookie = resp
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

/// Register an agent device and claim it for the logged-in user.
async fn add_device(client: &Client, base: &str, cookie: &str, device_id: &str) -> ChunkMap {
    let resp = client
        .post(format!("{base}/register"))
        .json(&serde_json::json!({
            "device_id": device_id,
            "public_key": "pk",
            "name": device_id,
            "claim_token": "tok",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/api/devices/claim"))
        .header(reqwest::header::COOKIE, cookie)
        .json(&serde_json::json!({ "device_id": device_id, "claim_token": "tok" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    Arc::new(DashMap::new())
}

async fn upload(client: &Client, base: &str, cookie: &str, name: &str, data: Vec<u8>) -> serde_json::Value {
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(data).file_name(name.to_string()),
    );
    let resp = client
        .post(format!("{base}/api/upload"))
        .header(reqwest::header::COOKIE, cookie)
        .multipart(form)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    if status != 200 {
        panic!("upload failed: {status} {}", resp.text().await.unwrap());
    }
    resp.json().await.unwrap()
}

async fn file_metadata(client: &Client, base: &str, file_id: &str) -> serde_json::Value {
    let resp = client
        .get(format!("{base}/metadata"))
        .query(&[("id", file_id)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_round_trip_single_device() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    let store = add_device(&client, &base, &cookie, "d1").await;
    spawn_agent(base.clone(), "d1".into(), store.clone(), true);

    // 2.5 MiB of the repeating byte pattern: 1 MiB + 1 MiB + 0.5 MiB.
    let data: Vec<u8> = (0..=255u8).cycle().take(5 * MIB / 2).collect();
    let result = upload(&client, &base, &cookie, "pattern.bin", data.clone()).await;
    assert_eq!(result["chunks"], 3);
    assert_eq!(result["size"], (5 * MIB / 2) as u64);
    let file_id = result["file_id"].as_str().unwrap().to_string();

    // Every chunk is placed on the only device.
    let meta = file_metadata(&client, &base, &file_id).await;
    let chunks = meta["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 3);
    for chunk in chunks {
        assert_eq!(chunk["locations"], serde_json::json!(["d1"]));
    }
    assert_eq!(chunks[0]["size"], MIB as u64);
    assert_eq!(chunks[1]["size"], MIB as u64);
    assert_eq!(chunks[2]["size"], (MIB / 2) as u64);

    // Download reproduces the exact bytes.
    let resp = client
        .get(format!("{base}/api/download"))
        .query(&[("id", file_id.as_str())])
        .header(reqwest::header::COOKIE, cookie.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"pattern.bin\""
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.to_vec(), data);
    assert_eq!(chunk_id(&body), meta["hash"].as_str().unwrap());
}

#[tokio::test]
async fn test_round_robin_two_devices() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    let store1 = add_device(&client, &base, &cookie, "d1").await;
    let store2 = add_device(&client, &base, &cookie, "d2").await;
    spawn_agent(base.clone(), "d1".into(), store1.clone(), true);
    spawn_agent(base.clone(), "d2".into(), store2.clone(), true);

    // Four distinct 1 MiB windows.
    let mut data = Vec::with_capacity(4 * MIB);
    for i in 0..4u8 {
        data.extend(std::iter::repeat(i).take(MIB));
    }
    let result = upload(&client, &base, &cookie, "four.bin", data).await;
    assert_eq!(result["chunks"], 4);
    let file_id = result["file_id"].as_str().unwrap().to_string();

    let meta = file_metadata(&client, &base, &file_id).await;
    let chunks = meta["chunks"].as_array().unwrap();
    let placements: Vec<&str> = chunks
        .iter()
        .map(|c| c["locations"][0].as_str().unwrap())
        .collect();
    assert_eq!(placements, vec!["d1", "d2", "d1", "d2"]);
    assert_eq!(store1.len(), 2);
    assert_eq!(store2.len(), 2);
}

#[tokio::test]
async fn test_failover_to_second_device() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    // d1 stores but never acks; d2 behaves.
    let store1 = add_device(&client, &base, &cookie, "d1").await;
    let store2 = add_device(&client, &base, &cookie, "d2").await;
    spawn_agent(base.clone(), "d1".into(), store1.clone(), false);
    spawn_agent(base.clone(), "d2".into(), store2.clone(), true);

    let data = vec![0xABu8; 10 * 1024];
    let result = upload(&client, &base, &cookie, "small.bin", data).await;
    assert_eq!(result["chunks"], 1);
    let file_id = result["file_id"].as_str().unwrap().to_string();

    // The unacked primary does not count as a placement.
    let meta = file_metadata(&client, &base, &file_id).await;
    assert_eq!(meta["chunks"][0]["locations"], serde_json::json!(["d2"]));
    assert_eq!(store2.len(), 1);
}

#[tokio::test]
async fn test_relay_one_shot_over_http() {
    let (base, _state) = start_server().await;
    let client = Client::new();

    let resp = client
        .post(format!("{base}/relay/send"))
        .query(&[("to", "A"), ("session", "s")])
        .body("b1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/relay/recv"))
        .query(&[("me", "A"), ("session", "s")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), b"b1".to_vec());

    // The FIFO was deleted on dequeue: a second recv times out.
    let resp = client
        .get(format!("{base}/relay/recv"))
        .query(&[("me", "A"), ("session", "s")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
}

#[tokio::test]
async fn test_delete_writes_ledger_and_notifies_agent() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    let store = add_device(&client, &base, &cookie, "d1").await;
    spawn_agent(base.clone(), "d1".into(), store.clone(), true);

    let t0 = chrono::Utc::now() - chrono::Duration::seconds(5);
    let result = upload(&client, &base, &cookie, "doomed.bin", vec![7u8; 2 * MIB]).await;
    let file_id = result["file_id"].as_str().unwrap().to_string();
    assert_eq!(store.len(), 1); // both windows are identical content

    let resp = client
        .delete(format!("{base}/api/delete"))
        .query(&[("id", file_id.as_str())])
        .header(reqwest::header::COOKIE, cookie.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // One ledger event carrying the file's chunk ids.
    let events: serde_json::Value = client
        .get(format!("{base}/api/sync/deletions"))
        .query(&[("since", t0.to_rfc3339())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events.as_array().unwrap().len(), 1);
    assert_eq!(events[0]["file_id"], file_id);
    assert_eq!(events[0]["chunk_ids"].as_array().unwrap().len(), 1);

    // A cursor past the event sees nothing.
    let later = chrono::Utc::now() + chrono::Duration::seconds(2);
    let events: serde_json::Value = client
        .get(format!("{base}/api/sync/deletions"))
        .query(&[("since", later.to_rfc3339())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(events.as_array().unwrap().is_empty());

    // The online agent received the DELETE command.
    for _ in 0..40 {
        if store.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(store.is_empty(), "agent did not process the delete");
}

#[tokio::test]
async fn test_rebalance_equalizes_two_devices() {
    let (base, state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    let store1 = add_device(&client, &base, &cookie, "d1").await;
    let store2 = add_device(&client, &base, &cookie, "d2").await;
    spawn_agent(base.clone(), "d1".into(), store1.clone(), true);
    spawn_agent(base.clone(), "d2".into(), store2.clone(), true);

    // Seed: ten 1 KiB chunks, all resident on d1.
    let user_id = state.db.find_user("user@test", &crate::api::auth::password_digest("pw"))
        .unwrap()
        .unwrap();
    let file_id = state.db.insert_file(&user_id, "seeded.bin").unwrap();
    let mut ids = Vec::new();
    for i in 0..10u8 {
        let data = vec![i; 1024];
        let id = chunk_id(&data);
        state.db.insert_chunk(&id, &file_id, i as u32, 1024).unwrap();
        state.db.add_location(&id, "d1").unwrap();
        store1.insert(id.clone(), data);
        ids.push(id);
    }

    let resp = client
        .post(format!("{base}/api/admin/rebalance"))
        .header(reqwest::header::COOKIE, cookie.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Wait for the detached run to finish.
    for _ in 0..100 {
        if state.rebalance_running.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(state.rebalance_running.is_empty(), "rebalance never finished");

    let on_d1 = state.db.chunks_on_device("d1", 100).unwrap().len();
    let on_d2 = state.db.chunks_on_device("d2", 100).unwrap().len();
    assert_eq!(on_d1 + on_d2, 10);
    assert!((on_d1 as i64 - on_d2 as i64).abs() <= 1, "d1={on_d1} d2={on_d2}");

    // Every chunk lives on exactly one device; none were lost mid-move.
    for id in &ids {
        let holders = state
            .db
            .online_holders(id, chrono::Duration::seconds(30))
            .unwrap();
        assert_eq!(holders.len(), 1, "chunk {id} has {} holders", holders.len());
    }
}

#[tokio::test]
async fn test_upload_without_devices_is_unavailable() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![1u8; 100]).file_name("x.bin"),
    );
    let resp = client
        .post(format!("{base}/api/upload"))
        .header(reqwest::header::COOKIE, cookie.as_str())
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_download_missing_chunk_is_unavailable() {
    let (base, state) = start_server().await;
    let client = Client::new();
    let cookie = login(&client, &base).await;

    // A file whose single chunk has no online holder.
    let user_id = state.db.find_user("user@test", &crate::api::auth::password_digest("pw"))
        .unwrap()
        .unwrap();
    let file_id = state.db.insert_file(&user_id, "ghost.bin").unwrap();
    state.db.insert_chunk("feed", &file_id, 0, 4).unwrap();

    let resp = client
        .get(format!("{base}/api/download"))
        .query(&[("id", file_id.as_str())])
        .header(reqwest::header::COOKIE, cookie.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_auth_is_required() {
    let (base, _state) = start_server().await;
    let client = Client::new();
    for path in ["/api/files", "/api/devices", "/api/me"] {
        let resp = client.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), 401, "expected 401 for {path}");
    }
}
