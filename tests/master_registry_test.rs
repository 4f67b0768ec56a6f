//! Master registry tests: a real HTTP listener driven through `MasterClient`

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

use fusionlink::registry::{
    ClientError, MasterClient, MasterConfig, MasterServer, Privacy, Registry, ServerFilter,
    SessionDescriptor, SessionUpdate,
};

struct TestMaster {
    base_url: String,
    registry: Arc<Registry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestMaster {
    async fn start(config: MasterConfig) -> Self {
        let server = MasterServer::new(config);
        let registry = server.registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            base_url,
            registry,
            shutdown: Some(tx),
            handle,
        }
    }

    fn client(&self) -> MasterClient {
        MasterClient::new(&self.base_url).unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        assert_ok!(self.handle.await.unwrap());
    }
}

fn session(name: &str, game_mode: &str, map: &str) -> SessionDescriptor {
    SessionDescriptor {
        server_name: name.to_string(),
        port: 7777,
        game_mode: game_mode.to_string(),
        map_name: map.to_string(),
        ..Default::default()
    }
}

/// Test: Register then list
/// Given a running master registry
/// When a host registers without an external address
/// Then the server list contains it with the caller's address
#[tokio::test]
async fn test_register_then_list() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();

    let server_id = client
        .register(&session("Friday Frag", "Deathmatch", "Arena"))
        .await
        .unwrap();
    assert!(!server_id.is_empty());

    let servers = client.list_servers(&ServerFilter::default()).await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].server_id, server_id);
    assert_eq!(servers[0].server_name, "Friday Frag");
    assert_eq!(servers[0].external_ip, "127.0.0.1");
    assert_eq!(servers[0].address(), "127.0.0.1:7777");

    master.stop().await;
}

/// Test: Server browser filters
#[tokio::test]
async fn test_list_filters() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();

    client
        .register(&session("Coop Night", "Cooperative", "Karnak"))
        .await
        .unwrap();
    client
        .register(&SessionDescriptor {
            current_players: 4,
            max_players: 4,
            ..session("Packed", "Deathmatch", "Karnak")
        })
        .await
        .unwrap();
    client
        .register(&SessionDescriptor {
            has_password: true,
            privacy: Privacy::PasswordProtected,
            ..session("Locked", "Deathmatch", "Sierra")
        })
        .await
        .unwrap();

    let by_mode = client
        .list_servers(&ServerFilter {
            game_mode: Some("deathmatch".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_mode.len(), 2);

    let by_map = client
        .list_servers(&ServerFilter {
            map: Some("KARNAK".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_map.len(), 2);

    let open = client
        .list_servers(&ServerFilter {
            not_full: true,
            no_password: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].server_name, "Coop Night");

    // Bare presence flags work without a value
    let raw: Vec<Value> = reqwest::get(master.url("/api/servers?notfull&nopassword"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(raw.len(), 1);

    master.stop().await;
}

/// Test: Heartbeats update counts and unknown servers are 404
#[tokio::test]
async fn test_heartbeat_update() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();
    let server_id = client
        .register(&session("Growing", "Deathmatch", "Arena"))
        .await
        .unwrap();

    client
        .heartbeat(
            &server_id,
            &SessionUpdate {
                current_players: Some(5),
                map_name: Some("Oasis".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stored = master.registry.get(&server_id).unwrap();
    assert_eq!(stored.current_players, 5);
    assert_eq!(stored.map_name, "Oasis");
    assert_eq!(stored.server_name, "Growing");

    // An empty body is a plain heartbeat
    let response = reqwest::Client::new()
        .put(master.url(&format!("/api/servers/{}", server_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": "updated" }));
    assert_eq!(master.registry.get(&server_id).unwrap().current_players, 5);

    match client.heartbeat("no-such-server", &SessionUpdate::default()).await {
        Err(ClientError::Status { status, message }) => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(message, "Server not found");
        }
        other => panic!("Expected 404, got {:?}", other),
    }

    master.stop().await;
}

/// Test: De-registration
#[tokio::test]
async fn test_unregister() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();
    let server_id = client
        .register(&session("Brief", "Deathmatch", "Arena"))
        .await
        .unwrap();

    assert_ok!(client.unregister(&server_id).await);
    assert!(client
        .list_servers(&ServerFilter::default())
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        client.unregister(&server_id).await,
        Err(ClientError::Status { status: StatusCode::NOT_FOUND, .. })
    ));

    master.stop().await;
}

/// Test: Stale sessions disappear
/// Given a registered session
/// When its heartbeat is older than the staleness bound
/// Then GET no longer lists it and a sweep removes it
#[tokio::test]
async fn test_stale_session_is_hidden_and_swept() {
    let master = TestMaster::start(MasterConfig {
        stale_after: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    let client = master.client();
    client
        .register(&session("Fading", "Deathmatch", "Arena"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(client
        .list_servers(&ServerFilter::default())
        .await
        .unwrap()
        .is_empty());
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total_servers, 1);
    assert_eq!(stats.active_servers, 0);

    assert_eq!(master.registry.sweep_at(Utc::now()), 1);
    assert_eq!(client.stats().await.unwrap().total_servers, 0);

    master.stop().await;
}

/// Test: Default staleness bound is 60 seconds
#[tokio::test]
async fn test_sixty_second_staleness() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();
    client
        .register(&session("Steady", "Deathmatch", "Arena"))
        .await
        .unwrap();

    assert_eq!(master.registry.sweep_at(Utc::now() + TimeDelta::seconds(30)), 0);
    assert_eq!(master.registry.sweep_at(Utc::now() + TimeDelta::seconds(61)), 1);
    assert!(client
        .list_servers(&ServerFilter::default())
        .await
        .unwrap()
        .is_empty());

    master.stop().await;
}

/// Test: Invite codes grant access to invite-only sessions
#[tokio::test]
async fn test_invite_flow() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();
    let server_id = client
        .register(&SessionDescriptor {
            privacy: Privacy::InviteOnly,
            ..session("Secret Base", "Cooperative", "Tomb")
        })
        .await
        .unwrap();

    let code = client
        .create_invite(&server_id, Some("host-id"), Some(30))
        .await
        .unwrap();
    assert_eq!(code.len(), 9);

    let server = client
        .validate_invite(&code, Some("friend-id"))
        .await
        .unwrap()
        .expect("valid invite");
    assert_eq!(server.server_id, server_id);
    assert!(server.can_join(Some("friend-id")));
    assert!(!server.can_join(Some("stranger")));

    // Same identity can redeem again
    assert!(client
        .validate_invite(&code, Some("friend-id"))
        .await
        .unwrap()
        .is_some());

    assert!(client
        .validate_invite("ZZZZ-ZZZZ", Some("friend-id"))
        .await
        .unwrap()
        .is_none());

    master.stop().await;
}

/// Test: Invite endpoints validate their input
#[tokio::test]
async fn test_invite_bad_requests() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(master.url("/api/invite/create"))
        .json(&json!({ "steamId": "someone" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "serverId required");

    let response = http
        .post(master.url("/api/invite/validate"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Lifetime may arrive as a string
    let response = http
        .post(master.url("/api/invite/create"))
        .json(&json!({ "serverId": "abc", "expires": "15" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert!(body["code"].is_string());

    master.stop().await;
}

/// Test: Aggregate stats
#[tokio::test]
async fn test_stats() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let client = master.client();

    for players in [2, 3] {
        client
            .register(&SessionDescriptor {
                current_players: players,
                ..session("Counted", "Deathmatch", "Arena")
            })
            .await
            .unwrap();
    }

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total_servers, 2);
    assert_eq!(stats.active_servers, 2);
    assert_eq!(stats.total_players, 5);

    let raw: Value = reqwest::get(master.url("/api/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        raw,
        json!({ "totalServers": 2, "activeServers": 2, "totalPlayers": 5 })
    );

    master.stop().await;
}

/// Test: CORS, preflight, unknown routes and malformed bodies
#[tokio::test]
async fn test_http_edges() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let http = reqwest::Client::new();

    let preflight = http
        .request(Method::OPTIONS, master.url("/api/servers"))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), StatusCode::OK);
    assert_eq!(
        preflight.headers()["access-control-allow-origin"],
        "*"
    );

    let missing = http.get(master.url("/api/nothing")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.headers()["access-control-allow-origin"], "*");
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Not found" }));

    let wrong_method = http.delete(master.url("/api/stats")).send().await.unwrap();
    assert_eq!(wrong_method.status(), StatusCode::NOT_FOUND);

    let garbage = http
        .post(master.url("/api/servers"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    let body: Value = garbage.json().await.unwrap();
    assert_eq!(body["error"], "Invalid server data");

    master.stop().await;
}

/// Test: Extractor failures still answer with JSON
/// Given a running master registry
/// When a server id in the path is not valid UTF-8
/// Then the reply is a 400 with a JSON error body
#[tokio::test]
async fn test_bad_path_is_json_error() {
    let master = TestMaster::start(MasterConfig::default()).await;
    let http = reqwest::Client::new();

    for request in [
        http.put(master.url("/api/servers/%FF")),
        http.delete(master.url("/api/servers/%FF")),
    ] {
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let body: Value = response.json().await.unwrap();
        assert!(
            body["error"].as_str().unwrap().contains("UTF-8"),
            "unexpected body: {}",
            body
        );
    }

    master.stop().await;
}
