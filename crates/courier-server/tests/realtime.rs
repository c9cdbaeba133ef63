//! End-to-end tests: full server on an ephemeral port, driven over real HTTP
//! and WebSocket connections.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use courier_db::models::FriendRequestRow;
use courier_db::now_string;
use courier_gateway::auth::issue_ws_token;
use courier_gateway::session::Gateway;
use courier_server::{Config, build};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    gateway: Gateway,
    root: PathBuf,
}

impl TestServer {
    async fn spawn() -> Self {
        let root = std::env::temp_dir().join(format!("courier-e2e-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            db_path: root.join("test.db"),
            media_root: root.join("media"),
            jwt_secret: "test-secret".into(),
            public_scheme: "http".into(),
        };
        let (app, gateway) = build(&config).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, gateway, root }
    }

    fn seed_user(&self, username: &str) -> i64 {
        self.gateway
            .db
            .create_user(username, "", "unused-hash", &now_string())
            .unwrap()
    }

    fn make_friends(&self, a: i64, b: i64) {
        let now = now_string();
        let req = self.gateway.db.create_friend_request(a, b, &now).unwrap();
        self.gateway
            .db
            .set_request_status(req.id, FriendRequestRow::ACCEPTED, &now)
            .unwrap();
    }

    async fn connect_ws(&self, user_id: i64, other_user_id: i64) -> Ws {
        let token = issue_ws_token(&self.gateway.jwt_secret, user_id);
        let url = format!(
            "ws://{}/realtime/conversation/{}?ws_token={}",
            self.addr, other_user_id, token
        );
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skip unrelated events (presence churn and the like) until one with the
/// wanted type tag arrives.
async fn wait_for_type(ws: &mut Ws, wanted: &str) -> Value {
    for _ in 0..20 {
        let event = next_json(ws).await;
        if event["type"] == wanted {
            return event;
        }
    }
    panic!("no '{}' event within 20 frames", wanted);
}

/// Collect one event of each wanted type, in whatever order they arrive.
async fn wait_for_pair(ws: &mut Ws, first: &str, second: &str) -> (Value, Value) {
    let mut a = None;
    let mut b = None;
    for _ in 0..20 {
        let event = next_json(ws).await;
        if a.is_none() && event["type"] == first {
            a = Some(event);
        } else if b.is_none() && event["type"] == second {
            b = Some(event);
        }
        if let (Some(a), Some(b)) = (&a, &b) {
            return (a.clone(), b.clone());
        }
    }
    panic!("no '{}' + '{}' pair within 20 frames", first, second);
}

/// Assert that no event of the given type arrives within the window.
async fn assert_no_event(ws: &mut Ws, unwanted: &str) {
    let result = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            let event = next_json(ws).await;
            if event["type"] == unwanted {
                return event;
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected '{}' event: {:?}", unwanted, result);
}

#[tokio::test]
async fn message_fan_out_between_friends() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let mut ws_a = server.connect_ws(alice, bob).await;
    let mut ws_b = server.connect_ws(bob, alice).await;
    wait_for_type(&mut ws_a, "presence_sync").await;
    wait_for_type(&mut ws_b, "presence_sync").await;

    // Tagged frame.
    ws_a.send(Message::text(r#"{"type":"content","content":"hi bob"}"#))
        .await
        .unwrap();
    let on_a = wait_for_type(&mut ws_a, "message").await;
    // The receiver's room copy plus a personal-group sidebar notification.
    let (on_b, sidebar) = wait_for_pair(&mut ws_b, "message", "sidebar").await;
    assert_eq!(on_a["data"], on_b["data"]);
    assert_eq!(on_a["data"]["content"], "hi bob");
    assert_eq!(on_a["data"]["sender"]["username"], "alice");
    assert_eq!(sidebar["data"]["id"], on_a["data"]["id"]);

    // Untagged legacy frame falls back to a plain send.
    ws_b.send(Message::text(r#"{"content":"hi alice"}"#)).await.unwrap();
    let reply = wait_for_type(&mut ws_a, "message").await;
    assert_eq!(reply["data"]["content"], "hi alice");
    assert_eq!(reply["data"]["sender"]["id"], bob);
}

#[tokio::test]
async fn only_the_sender_may_edit() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let mut ws_a = server.connect_ws(alice, bob).await;
    let mut ws_b = server.connect_ws(bob, alice).await;
    wait_for_type(&mut ws_a, "presence_sync").await;
    wait_for_type(&mut ws_b, "presence_sync").await;

    ws_a.send(Message::text(r#"{"type":"content","content":"original"}"#))
        .await
        .unwrap();
    let msg = wait_for_type(&mut ws_b, "message").await;
    let message_id = msg["data"]["id"].as_i64().unwrap();

    // Bob does not own the message; his edit is dropped without fan-out.
    ws_b.send(Message::text(
        json!({"type": "edit", "message_id": message_id, "content": "hijacked"}).to_string(),
    ))
    .await
    .unwrap();
    assert_no_event(&mut ws_a, "message_updated").await;

    ws_a.send(Message::text(
        json!({"type": "edit", "message_id": message_id, "content": "fixed"}).to_string(),
    ))
    .await
    .unwrap();
    for ws in [&mut ws_a, &mut ws_b] {
        let updated = wait_for_type(ws, "message_updated").await;
        assert_eq!(updated["data"]["content"], "fixed");
        assert_eq!(updated["data"]["is_edited"], true);
    }
}

#[tokio::test]
async fn delivered_ack_reaches_the_room_even_for_unknown_messages() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let mut ws_a = server.connect_ws(alice, bob).await;
    let mut ws_b = server.connect_ws(bob, alice).await;
    wait_for_type(&mut ws_a, "presence_sync").await;
    wait_for_type(&mut ws_b, "presence_sync").await;

    ws_a.send(Message::text(r#"{"type":"content","content":"seen?"}"#))
        .await
        .unwrap();
    let msg = wait_for_type(&mut ws_b, "message").await;
    let message_id = msg["data"]["id"].as_i64().unwrap();

    ws_b.send(Message::text(
        json!({"type": "delivered", "message_id": message_id}).to_string(),
    ))
    .await
    .unwrap();
    let ack = wait_for_type(&mut ws_a, "delivered").await;
    assert_eq!(ack["user"], bob);
    assert_eq!(ack["message_id"], message_id);

    // An ack for a message that no longer exists is still relayed to the
    // room; only the personal-group copies depend on the record.
    ws_b.send(Message::text(json!({"type": "delivered", "message_id": 999_999}).to_string()))
        .await
        .unwrap();
    let ack = wait_for_type(&mut ws_a, "delivered").await;
    assert_eq!(ack["message_id"], 999_999);
}

#[tokio::test]
async fn delete_tombstones_and_reactions_toggle() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let mut ws_a = server.connect_ws(alice, bob).await;
    let mut ws_b = server.connect_ws(bob, alice).await;
    wait_for_type(&mut ws_a, "presence_sync").await;
    wait_for_type(&mut ws_b, "presence_sync").await;

    ws_a.send(Message::text(r#"{"type":"content","content":"ephemeral"}"#))
        .await
        .unwrap();
    let msg = wait_for_type(&mut ws_b, "message").await;
    let message_id = msg["data"]["id"].as_i64().unwrap();

    ws_b.send(Message::text(
        json!({"type": "react", "message_id": message_id, "emoji": "🔥"}).to_string(),
    ))
    .await
    .unwrap();
    let reaction = wait_for_type(&mut ws_a, "reaction").await;
    assert_eq!(reaction["action"], "added");
    assert_eq!(reaction["user"], bob);

    ws_b.send(Message::text(
        json!({"type": "react", "message_id": message_id, "emoji": "🔥"}).to_string(),
    ))
    .await
    .unwrap();
    let reaction = wait_for_type(&mut ws_a, "reaction").await;
    assert_eq!(reaction["action"], "removed");

    ws_a.send(Message::text(json!({"type": "delete", "message_id": message_id}).to_string()))
        .await
        .unwrap();
    let deleted = wait_for_type(&mut ws_b, "message_updated").await;
    assert_eq!(deleted["data"]["is_deleted"], true);
    assert_eq!(deleted["data"]["content"], "This message was deleted");
    assert_eq!(deleted["data"]["attachment_url"], Value::Null);
}

#[tokio::test]
async fn non_friends_are_closed_with_4403() {
    let server = TestServer::spawn().await;
    let carol = server.seed_user("carol");
    let dave = server.seed_user("dave");

    let mut ws = server.connect_ws(carol, dave).await;
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4403);
                break;
            }
            Some(Ok(Message::Text(_))) => panic!("events leaked to a non-friend"),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("closed without a close frame"),
        }
    }
}

#[tokio::test]
async fn bad_credential_is_closed_with_4401() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let url = format!(
        "ws://{}/realtime/conversation/{}?ws_token=garbage",
        server.addr, bob
    );
    let (mut ws, _) = connect_async(url).await.unwrap();
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4401);
                break;
            }
            Some(Ok(Message::Text(_))) => panic!("events leaked without authentication"),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("closed without a close frame"),
        }
    }
}

#[tokio::test]
async fn presence_sync_then_online_and_offline_broadcasts() {
    let server = TestServer::spawn().await;
    let alice = server.seed_user("alice");
    let bob = server.seed_user("bob");
    server.make_friends(alice, bob);

    let mut ws_a = server.connect_ws(alice, bob).await;
    let sync = wait_for_type(&mut ws_a, "presence_sync").await;
    assert!(sync["users"].as_array().unwrap().contains(&json!(alice)));

    let mut ws_b = server.connect_ws(bob, alice).await;
    let sync_b = wait_for_type(&mut ws_b, "presence_sync").await;
    let users = sync_b["users"].as_array().unwrap();
    assert!(users.contains(&json!(alice)));
    assert!(users.contains(&json!(bob)));

    let online = wait_for_type(&mut ws_a, "presence").await;
    assert_eq!(online["user"], bob);
    assert_eq!(online["online"], true);

    drop(ws_b);
    let offline = wait_for_type(&mut ws_a, "presence").await;
    assert_eq!(offline["user"], bob);
    assert_eq!(offline["online"], false);
}

#[tokio::test]
async fn rest_flow_register_befriend_send_and_history() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Register both users over the API.
    let alice: Value = client
        .post(server.http_url("/api/auth/register"))
        .json(&json!({"username": "alice", "password": "correct horse"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bob: Value = client
        .post(server.http_url("/api/auth/register"))
        .json(&json!({"username": "bob", "password": "battery staple"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let (alice_id, alice_token) = (alice["user_id"].as_i64().unwrap(), alice["token"].as_str().unwrap());
    let (bob_id, bob_token) = (bob["user_id"].as_i64().unwrap(), bob["token"].as_str().unwrap());

    // Login works with the registered password.
    let login = client
        .post(server.http_url("/api/auth/login"))
        .json(&json!({"username": "alice", "password": "correct horse"}))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), 200);

    // Friend request and acceptance.
    let created = client
        .post(server.http_url("/api/friend-requests"))
        .bearer_auth(alice_token)
        .json(&json!({"to_user_id": bob_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let request: Value = created.json().await.unwrap();

    let responded = client
        .post(server.http_url(&format!(
            "/api/friend-requests/{}/respond",
            request["id"].as_i64().unwrap()
        )))
        .bearer_auth(bob_token)
        .json(&json!({"action": "accept"}))
        .send()
        .await
        .unwrap();
    assert_eq!(responded.status(), 200);

    let friends: Value = client
        .get(server.http_url("/api/friends"))
        .bearer_auth(alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(friends[0]["id"], bob_id);

    // Bob listens on the conversation socket, using a ws-token from the API.
    let ws_token: Value = client
        .post(server.http_url("/api/auth/ws-token"))
        .bearer_auth(bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = format!(
        "ws://{}/realtime/conversation/{}?ws_token={}",
        server.addr,
        alice_id,
        ws_token["ws_token"].as_str().unwrap()
    );
    let (mut ws_b, _) = connect_async(url).await.unwrap();
    wait_for_type(&mut ws_b, "presence_sync").await;

    // Alice sends a message with an attachment over HTTP.
    let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    let form = reqwest::multipart::Form::new()
        .text("receiver", bob_id.to_string())
        .text("content", "check this out")
        .part(
            "attachment",
            reqwest::multipart::Part::bytes(png.to_vec()).file_name("pic.png"),
        );
    let sent = client
        .post(server.http_url("/api/chat/send"))
        .bearer_auth(alice_token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), 201);
    let doc: Value = sent.json().await.unwrap();
    let attachment_url = doc["attachment_url"].as_str().unwrap();
    assert!(attachment_url.starts_with("http://"));
    assert_eq!(doc["attachment_name"], "pic.png");
    assert_eq!(doc["attachment_type"], "image/png");

    // The stored object is served back under /media.
    let served = client.get(attachment_url).send().await.unwrap();
    assert_eq!(served.status(), 200);
    assert_eq!(served.bytes().await.unwrap().as_ref(), png);

    // Realtime fan-out reaches Bob with the same document.
    let (on_b, sidebar) = wait_for_pair(&mut ws_b, "message", "sidebar").await;
    assert_eq!(on_b["data"], doc);
    assert_eq!(sidebar["data"]["id"], doc["id"]);

    // History returns the identical projection.
    let history: Value = client
        .get(server.http_url(&format!("/api/chat/conversation/{}", bob_id)))
        .bearer_auth(alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0], doc);
}

#[tokio::test]
async fn history_is_friendship_gated() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let carol: Value = client
        .post(server.http_url("/api/auth/register"))
        .json(&json!({"username": "carol", "password": "long enough"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let dave: Value = client
        .post(server.http_url("/api/auth/register"))
        .json(&json!({"username": "dave", "password": "long enough"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let resp = client
        .get(server.http_url(&format!(
            "/api/chat/conversation/{}",
            dave["user_id"].as_i64().unwrap()
        )))
        .bearer_auth(carol["token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .get(server.http_url("/api/chat/conversation/9999"))
        .bearer_auth(carol["token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Sending distinguishes a missing receiver from a non-friend one.
    let form = reqwest::multipart::Form::new()
        .text("receiver", "9999")
        .text("content", "anyone there?");
    let resp = client
        .post(server.http_url("/api/chat/send"))
        .bearer_auth(carol["token"].as_str().unwrap())
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let form = reqwest::multipart::Form::new()
        .text("receiver", dave["user_id"].as_i64().unwrap().to_string())
        .text("content", "we are not friends");
    let resp = client
        .post(server.http_url("/api/chat/send"))
        .bearer_auth(carol["token"].as_str().unwrap())
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}
