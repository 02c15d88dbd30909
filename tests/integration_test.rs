//! End-to-end tests over real sockets: every test starts a replica (or two),
//! speaks the line-framed client protocol and checks the responses.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};

use event_mesh::config::{ReplicaConfig, ServerUrl, UserWithPassword};
use event_mesh::event::{Event, Job};
use event_mesh::replica::Replica;

fn address(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

fn standard_users() -> Vec<UserWithPassword> {
    vec![
        UserWithPassword {
            id: 1,
            username: "user1".to_string(),
            password: "pass1".to_string(),
        },
        UserWithPassword {
            id: 2,
            username: "test".to_string(),
            password: "test".to_string(),
        },
    ]
}

/// A deployment whose client ports are `ports` and whose inter-server ports
/// sit 1000 above, seen from replica `id`.
fn config_for(id: u32, ports: &[u16]) -> ReplicaConfig {
    ReplicaConfig {
        id,
        servers: ports
            .iter()
            .map(|port| ServerUrl {
                client: address(*port),
                server: address(port + 1000),
            })
            .collect(),
        users: standard_users(),
        events: Vec::new(),
        debug: false,
        show_infos_logs: false,
    }
}

async fn start_single(port: u16) -> Replica {
    Replica::start(config_for(0, &[port]))
        .await
        .expect("the replica should start")
}

struct TestClient {
    lines: Framed<TcpStream, LinesCodec>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = loop {
            match TcpStream::connect(address(port)).await {
                Ok(stream) => break stream,
                Err(_) => sleep(Duration::from_millis(25)).await,
            }
        };
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn send(&mut self, line: String) {
        self.lines.send(line).await.expect("the send should succeed");
    }

    async fn next_json(&mut self) -> Value {
        let line = self
            .lines
            .next()
            .await
            .expect("the server should answer")
            .expect("a whole frame");
        serde_json::from_str(&line).expect("valid json")
    }

    /// One full request: endpoint line, header, credentials when asked for,
    /// payload, response. Failures come back as their error string.
    async fn request(
        &mut self,
        endpoint: &str,
        credentials: Option<(&str, &str)>,
        payload: Value,
    ) -> Result<Value, String> {
        self.send(endpoint.to_string()).await;
        let header = self.next_json().await;
        if !header["valid"].as_bool().unwrap_or(false) {
            return Err("invalid endpoint".to_string());
        }
        if header["needsAuth"].as_bool().unwrap_or(false) {
            let (username, password) = credentials.expect("credentials are required here");
            self.send(json!({"username": username, "password": password}).to_string())
                .await;
            let auth = self.next_json().await;
            if !auth["success"].as_bool().unwrap_or(false) {
                return Err("invalid credentials".to_string());
            }
        }
        self.send(payload.to_string()).await;
        let response = self.next_json().await;
        if response["success"].as_bool().unwrap_or(false) {
            Ok(response["data"].clone())
        } else {
            Err(response["data"].as_str().unwrap_or_default().to_string())
        }
    }

    async fn create_sample_event(&mut self, credentials: (&str, &str)) -> Value {
        self.request(
            "create",
            Some(credentials),
            json!({"name": "Spring gala", "jobs": [{"name": "Bar", "capacity": 2}]}),
        )
        .await
        .expect("the create should succeed")
    }
}

#[tokio::test]
async fn creates_an_event_with_its_jobs() {
    let replica = start_single(14100).await;
    let mut client = TestClient::connect(14100).await;

    let event = client.create_sample_event(("user1", "pass1")).await;
    assert_eq!(event["id"], json!(1));
    assert_eq!(event["name"], json!("Spring gala"));
    assert_eq!(event["open"], json!(true));
    assert_eq!(event["organizer"]["id"], json!(1));
    assert_eq!(event["organizer"]["username"], json!("user1"));
    assert_eq!(event["jobs"][0]["id"], json!(1));
    assert_eq!(event["jobs"][0]["name"], json!("Bar"));
    assert_eq!(event["jobs"][0]["capacity"], json!(2));
    assert_eq!(event["jobs"][0]["count"], json!(0));
    assert!(event["participants"].as_array().unwrap().is_empty());

    replica.stop();
}

#[tokio::test]
async fn the_organizer_closes_their_event() {
    let replica = start_single(14110).await;
    let mut client = TestClient::connect(14110).await;

    client.create_sample_event(("user1", "pass1")).await;
    let event = client
        .request("close", Some(("user1", "pass1")), json!({"eventId": 1}))
        .await
        .expect("the close should succeed");
    assert_eq!(event["open"], json!(false));

    replica.stop();
}

#[tokio::test]
async fn registers_a_user_to_a_job() {
    let replica = start_single(14120).await;
    let mut client = TestClient::connect(14120).await;

    client.create_sample_event(("user1", "pass1")).await;
    let event = client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect("the register should succeed");
    assert_eq!(event["jobs"][0]["capacity"], json!(2));
    assert_eq!(event["jobs"][0]["count"], json!(1));
    assert_eq!(event["participants"][0]["user"]["id"], json!(1));
    assert_eq!(event["participants"][0]["jobId"], json!(1));

    replica.stop();
}

#[tokio::test]
async fn shows_the_whole_catalog() {
    let replica = start_single(14130).await;
    let mut client = TestClient::connect(14130).await;

    client.create_sample_event(("user1", "pass1")).await;
    client.create_sample_event(("test", "test")).await;
    let events = client
        .request("show", None, json!({"eventId": -1, "resume": false}))
        .await
        .expect("the show should succeed");
    assert_eq!(events.as_array().unwrap().len(), 2);
    assert_eq!(events[1]["id"], json!(2));
    assert_eq!(events[1]["organizer"]["username"], json!("test"));

    replica.stop();
}

#[tokio::test]
async fn shows_a_single_event_and_ignores_the_resume_hint() {
    let replica = start_single(14140).await;
    let mut client = TestClient::connect(14140).await;

    client.create_sample_event(("user1", "pass1")).await;
    let event = client
        .request("show", None, json!({"eventId": 1, "resume": true}))
        .await
        .expect("the show should succeed");
    assert_eq!(event["id"], json!(1));
    assert_eq!(event["name"], json!("Spring gala"));

    replica.stop();
}

#[tokio::test]
async fn reregistering_overwrites_the_previous_job() {
    let replica = start_single(14160).await;
    let mut client = TestClient::connect(14160).await;

    client
        .request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "Spring gala", "jobs": [
                {"name": "Bar", "capacity": 2},
                {"name": "Door", "capacity": 3}
            ]}),
        )
        .await
        .expect("the create should succeed");

    client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect("the first register should succeed");
    // same job again: still a single entry
    let event = client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect("the repeated register should succeed");
    assert_eq!(event["participants"].as_array().unwrap().len(), 1);

    // switching jobs moves the single entry
    let event = client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 2}),
        )
        .await
        .expect("the switch should succeed");
    let participants = event["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["jobId"], json!(2));
    assert_eq!(event["jobs"][0]["count"], json!(0));
    assert_eq!(event["jobs"][1]["count"], json!(1));

    replica.stop();
}

#[tokio::test]
async fn rejects_invalid_credentials() {
    let replica = start_single(14170).await;
    let mut client = TestClient::connect(14170).await;

    let error = client
        .request(
            "create",
            Some(("asd", "asd")),
            json!({"name": "Spring gala", "jobs": []}),
        )
        .await
        .expect_err("the auth should fail");
    assert_eq!(error, "invalid credentials");

    // the connection survives an abandoned request
    let event = client.create_sample_event(("user1", "pass1")).await;
    assert_eq!(event["id"], json!(1));

    replica.stop();
}

#[tokio::test]
async fn refuses_registration_on_a_closed_event() {
    let replica = start_single(14180).await;
    let mut client = TestClient::connect(14180).await;

    client.create_sample_event(("user1", "pass1")).await;
    client
        .request("close", Some(("user1", "pass1")), json!({"eventId": 1}))
        .await
        .expect("the close should succeed");
    let error = client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect_err("the register should fail");
    assert_eq!(error, "event is closed");

    replica.stop();
}

#[tokio::test]
async fn only_the_organizer_may_close() {
    let replica = start_single(14190).await;
    let mut client = TestClient::connect(14190).await;

    client.create_sample_event(("user1", "pass1")).await;
    let error = client
        .request("close", Some(("test", "test")), json!({"eventId": 1}))
        .await
        .expect_err("the close should fail");
    assert_eq!(error, "you are not the organizer");

    replica.stop();
}

#[tokio::test]
async fn closing_twice_reports_the_event_already_closed() {
    let replica = start_single(14200).await;
    let mut client = TestClient::connect(14200).await;

    client.create_sample_event(("user1", "pass1")).await;
    client
        .request("close", Some(("user1", "pass1")), json!({"eventId": 1}))
        .await
        .expect("the close should succeed");
    let error = client
        .request("close", Some(("user1", "pass1")), json!({"eventId": 1}))
        .await
        .expect_err("the second close should fail");
    assert_eq!(error, "event already closed");

    replica.stop();
}

#[tokio::test]
async fn shows_nothing_for_an_unknown_event() {
    let replica = start_single(14210).await;
    let mut client = TestClient::connect(14210).await;

    let error = client
        .request("show", None, json!({"eventId": 1, "resume": false}))
        .await
        .expect_err("the show should fail");
    assert_eq!(error, "event not found");

    replica.stop();
}

#[tokio::test]
async fn validates_names_and_capacities_on_create() {
    let replica = start_single(14220).await;
    let mut client = TestClient::connect(14220).await;

    let error = client
        .request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "", "jobs": [{"name": "Bar", "capacity": 2}]}),
        )
        .await
        .expect_err("an empty event name should fail");
    assert_eq!(error, "name is required");

    let error = client
        .request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "Spring gala", "jobs": [{"name": "", "capacity": 2}]}),
        )
        .await
        .expect_err("an empty job name should fail");
    assert_eq!(error, "name is required");

    let error = client
        .request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "Spring gala", "jobs": [{"name": "Bar", "capacity": -1}]}),
        )
        .await
        .expect_err("a non-positive capacity should fail");
    assert_eq!(error, "capacity must be greater than 0");

    replica.stop();
}

#[tokio::test]
async fn rejects_unknown_and_full_jobs() {
    let replica = start_single(14230).await;
    let mut client = TestClient::connect(14230).await;

    client
        .request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "Spring gala", "jobs": [{"name": "Bar", "capacity": 1}]}),
        )
        .await
        .expect("the create should succeed");

    let error = client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 9}),
        )
        .await
        .expect_err("an unknown job should fail");
    assert_eq!(error, "job not found");

    client
        .request(
            "register",
            Some(("user1", "pass1")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect("the register should succeed");
    let error = client
        .request(
            "register",
            Some(("test", "test")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect_err("the job should be full");
    assert_eq!(error, "job is full");

    replica.stop();
}

#[tokio::test]
async fn an_unknown_endpoint_does_not_kill_the_connection() {
    let replica = start_single(14240).await;
    let mut client = TestClient::connect(14240).await;

    client.send("frobnicate".to_string()).await;
    let header = client.next_json().await;
    assert_eq!(header["valid"], json!(false));

    let event = client.create_sample_event(("user1", "pass1")).await;
    assert_eq!(event["id"], json!(1));

    replica.stop();
}

#[tokio::test]
async fn serves_the_catalog_seeded_in_the_configuration() {
    let mut config = config_for(0, &[14250]);
    config.events = vec![Event {
        id: 1,
        name: "Opening night".to_string(),
        open: true,
        organizer_id: 1,
        jobs: BTreeMap::from([(
            1,
            Job {
                id: 1,
                name: "Stage".to_string(),
                capacity: 4,
            },
        )]),
        participants: BTreeMap::from([(2, 1)]),
    }];
    let replica = Replica::start(config).await.expect("the replica should start");
    let mut client = TestClient::connect(14250).await;

    let event = client
        .request("show", None, json!({"eventId": 1, "resume": false}))
        .await
        .expect("the show should succeed");
    assert_eq!(event["name"], json!("Opening night"));
    assert_eq!(event["jobs"][0]["count"], json!(1));
    assert_eq!(event["participants"][0]["user"]["username"], json!("test"));

    replica.stop();
}

#[tokio::test]
async fn concurrent_creates_on_two_replicas_get_distinct_ids() {
    let ports = [14300, 14301];
    let (first, second) = tokio::join!(
        Replica::start(config_for(0, &ports)),
        Replica::start(config_for(1, &ports)),
    );
    let first = first.expect("replica 0 should start");
    let second = second.expect("replica 1 should start");

    let mut client_a = TestClient::connect(14300).await;
    let mut client_b = TestClient::connect(14301).await;

    let (on_a, on_b) = tokio::join!(
        client_a.request(
            "create",
            Some(("user1", "pass1")),
            json!({"name": "Created on A", "jobs": [{"name": "Door", "capacity": 1}]}),
        ),
        client_b.request(
            "create",
            Some(("test", "test")),
            json!({"name": "Created on B", "jobs": [{"name": "Door", "capacity": 1}]}),
        ),
    );
    let on_a = on_a.expect("the create on replica 0 should succeed");
    let on_b = on_b.expect("the create on replica 1 should succeed");

    let mut ids = vec![
        on_a["id"].as_i64().expect("an id"),
        on_b["id"].as_i64().expect("an id"),
    ];
    ids.sort();
    assert_eq!(ids, vec![1, 2]);

    // let the trailing release reach the other side
    sleep(Duration::from_millis(300)).await;

    let catalog_a = client_a
        .request("show", None, json!({"eventId": -1, "resume": false}))
        .await
        .expect("the show should succeed");
    let catalog_b = client_b
        .request("show", None, json!({"eventId": -1, "resume": false}))
        .await
        .expect("the show should succeed");
    assert_eq!(catalog_a.as_array().unwrap().len(), 2);
    assert_eq!(catalog_a, catalog_b);

    first.stop();
    second.stop();
}

#[tokio::test]
async fn mutations_replicate_to_the_other_replica() {
    let ports = [14320, 14321];
    let (first, second) = tokio::join!(
        Replica::start(config_for(0, &ports)),
        Replica::start(config_for(1, &ports)),
    );
    let first = first.expect("replica 0 should start");
    let second = second.expect("replica 1 should start");

    let mut client_a = TestClient::connect(14320).await;
    let mut client_b = TestClient::connect(14321).await;

    client_a.create_sample_event(("user1", "pass1")).await;
    sleep(Duration::from_millis(200)).await;

    // the event created on A is visible and mutable through B
    let event = client_b
        .request(
            "register",
            Some(("test", "test")),
            json!({"eventId": 1, "jobId": 1}),
        )
        .await
        .expect("the register through replica 1 should succeed");
    assert_eq!(event["jobs"][0]["count"], json!(1));
    sleep(Duration::from_millis(200)).await;

    let event = client_a
        .request("show", None, json!({"eventId": 1, "resume": false}))
        .await
        .expect("the show should succeed");
    assert_eq!(event["participants"][0]["user"]["username"], json!("test"));

    let event = client_a
        .request("close", Some(("user1", "pass1")), json!({"eventId": 1}))
        .await
        .expect("the close should succeed");
    assert_eq!(event["open"], json!(false));
    sleep(Duration::from_millis(200)).await;

    let event = client_b
        .request("show", None, json!({"eventId": 1, "resume": false}))
        .await
        .expect("the show should succeed");
    assert_eq!(event["open"], json!(false));

    first.stop();
    second.stop();
}
