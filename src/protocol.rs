//! The client-facing request pipeline: per-connection header/auth/payload
//! exchange, plus the replica-wide queue that runs handlers one at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::Connection;
use crate::event::{User, UserId};
use crate::log;
use crate::message::{AuthId, AuthResponse, Credentials, HeaderResponse, ServerResponse};
use crate::service::EventService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Create,
    Show,
    Close,
    Register,
}

impl EndpointKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Self::Create),
            "show" => Some(Self::Show),
            "close" => Some(Self::Close),
            "register" => Some(Self::Register),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Show => "show",
            Self::Close => "close",
            Self::Register => "register",
        }
    }

    pub fn needs_auth(self) -> bool {
        !matches!(self, Self::Show)
    }
}

/// A fully-read request, parked until the dispatcher picks it up.
pub struct DispatchJob {
    pub kind: EndpointKind,
    pub auth_id: AuthId,
    pub payload: String,
    pub reply: oneshot::Sender<ServerResponse>,
}

pub type DispatchQueue = mpsc::Sender<DispatchJob>;

pub fn dispatch_channel() -> (DispatchQueue, mpsc::Receiver<DispatchJob>) {
    // capacity one: connections park here while another handler runs
    mpsc::channel(1)
}

/// Runs queued handlers strictly one at a time, so a handler's
/// prepare / acquire / apply / release sequence is atomic on this replica.
pub async fn process_requests(
    service: EventService,
    mut jobs: mpsc::Receiver<DispatchJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        log::info(&format!("Start processing a {} request.", job.kind.name()));
        let response = service.dispatch(job.kind, job.auth_id, &job.payload).await;
        let _ = job.reply.send(response);
        log::info(&format!("Finished processing the {} request.", job.kind.name()));
    }
    log::info("Request dispatcher stopped.");
}

/// The authentication oracle is the user table, by plain equality. Empty
/// credentials fail without a scan.
pub fn authenticate(users: &BTreeMap<UserId, User>, credentials: &Credentials) -> Option<AuthId> {
    if credentials.username.is_empty() || credentials.password.is_empty() {
        return None;
    }
    users
        .values()
        .find(|user| {
            user.username == credentials.username && user.password == credentials.password
        })
        .map(|user| user.id)
}

/// Drives one client connection. At most one request is in flight: the next
/// endpoint line is only read after the previous response went out.
pub async fn handle_connection(
    stream: TcpStream,
    users: Arc<BTreeMap<UserId, User>>,
    queue: DispatchQueue,
) {
    let mut connection = Connection::new(stream);
    loop {
        if connection.is_closed() {
            break;
        }

        let endpoint_line = match connection.receive_message().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                log::warning(&format!("Error while receiving the endpoint name: {error}"));
                break;
            }
        };

        let kind = EndpointKind::parse(endpoint_line.trim());
        let header = HeaderResponse {
            valid: kind.is_some(),
            needs_auth: kind.map(EndpointKind::needs_auth).unwrap_or(false),
        };
        if let Err(error) = connection.send_json(&header).await {
            log::warning(&format!("Error while sending the header: {error}"));
            break;
        }

        let Some(kind) = kind else {
            log::warning("Unknown endpoint, canceling the request.");
            continue;
        };

        let mut auth_id: AuthId = -1;
        if kind.needs_auth() {
            let credentials: Credentials = match connection.receive_json().await {
                Ok(Some(credentials)) => credentials,
                Ok(None) => break,
                Err(error) => {
                    log::warning(&format!("Error while receiving credentials: {error}"));
                    continue;
                }
            };
            let verdict = authenticate(&users, &credentials);
            let response = AuthResponse {
                success: verdict.is_some(),
                auth_id: verdict.unwrap_or(-1),
            };
            if let Err(error) = connection.send_json(&response).await {
                log::warning(&format!("Error while sending the auth response: {error}"));
                break;
            }
            match verdict {
                Some(id) => auth_id = id,
                None => {
                    log::warning("Invalid credentials, canceling the request.");
                    continue;
                }
            }
        }

        let payload = match connection.receive_message().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                log::warning(&format!("Error while receiving the payload: {error}"));
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = DispatchJob {
            kind,
            auth_id,
            payload,
            reply: reply_tx,
        };
        if queue.send(job).await.is_err() {
            // the replica is shutting down
            break;
        }
        let response = match reply_rx.await {
            Ok(response) => response,
            Err(_) => break,
        };
        if let Err(error) = connection.send_json(&response).await {
            log::warning(&format!("Error while sending the response: {error}"));
            break;
        }
    }
    log::info("Client connection closed.");
}
