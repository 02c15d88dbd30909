//! The inter-server transport: one persistent framed socket to every other
//! replica. Each replica dials the peers with a higher id and waits for the
//! lower ids to dial in, then every socket is registered under the peer id
//! announced in its greeting frame.

use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};

use crate::log;
use crate::message::{Greeting, PeerEnvelope};

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Merged inbound stream: every peer frame, tagged with the sender id.
/// Delivery is ordered per peer, unordered across peers.
pub type PeerFrames = mpsc::UnboundedReceiver<(u32, PeerEnvelope)>;

/// Cheap handle for sending to the mesh. The matching [`PeerFrames`] receiver
/// is handed out once, at connect time.
#[derive(Clone)]
pub struct PeerNetwork {
    my_id: u32,
    outboxes: Arc<HashMap<u32, mpsc::UnboundedSender<String>>>,
}

impl PeerNetwork {
    /// Establishes the full mesh and blocks until every peer is linked.
    pub async fn connect(
        my_id: u32,
        listener: TcpListener,
        peers: &[(u32, String)],
    ) -> Result<(Self, PeerFrames), Box<dyn Error + Send + Sync>> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let expected_inbound = peers.iter().filter(|(id, _)| *id < my_id).count();

        let dial = async {
            let mut dialed = Vec::new();
            for (peer_id, address) in peers.iter().filter(|(id, _)| *id > my_id) {
                // the peer may not be up yet
                let stream = loop {
                    match TcpStream::connect(address).await {
                        Ok(stream) => break stream,
                        Err(_) => sleep(DIAL_RETRY_INTERVAL).await,
                    }
                };
                let mut lines = Framed::new(stream, LinesCodec::new());
                lines.send(Greeting { id: my_id }.to_json_string()?).await?;
                dialed.push((*peer_id, lines));
            }
            Ok::<_, Box<dyn Error + Send + Sync>>(dialed)
        };

        let accept = async {
            let mut accepted = Vec::new();
            for _ in 0..expected_inbound {
                let (stream, _) = listener.accept().await?;
                let mut lines = Framed::new(stream, LinesCodec::new());
                let greeting = match lines.next().await {
                    Some(Ok(line)) => Greeting::from_json_string(&line)?,
                    _ => return Err("peer closed before sending its greeting".into()),
                };
                accepted.push((greeting.id, lines));
            }
            Ok::<_, Box<dyn Error + Send + Sync>>(accepted)
        };

        let (dialed, accepted) = tokio::try_join!(dial, accept)?;

        let mut outboxes = HashMap::new();
        for (peer_id, lines) in dialed.into_iter().chain(accepted) {
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            outboxes.insert(peer_id, outbox_tx);
            register(peer_id, lines, outbox_rx, inbound_tx.clone());
            log::info(&cformat!("Linked with peer <bold>{}</bold>.", peer_id));
        }
        log::success(&cformat!(
            "Connected to all <bold>{}</bold> peers.",
            outboxes.len()
        ));

        Ok((
            Self {
                my_id,
                outboxes: Arc::new(outboxes),
            },
            inbound_rx,
        ))
    }

    pub fn my_id(&self) -> u32 {
        self.my_id
    }

    pub fn peer_ids(&self) -> Vec<u32> {
        self.outboxes.keys().copied().collect()
    }

    /// Sends the same frame to every registered peer. A peer whose socket
    /// broke is logged and skipped; this deployment treats it as gone.
    pub fn broadcast(&self, envelope: &PeerEnvelope) {
        let frame = match envelope.to_json_string() {
            Ok(frame) => frame,
            Err(error) => {
                log::error(&format!("Couldn't encode a peer frame: {error}"));
                return;
            }
        };
        for (peer_id, outbox) in self.outboxes.iter() {
            if outbox.send(frame.clone()).is_err() {
                log::warning(&format!("Peer {peer_id} is gone, dropping the frame."));
            }
        }
    }

    pub fn send_to(&self, peer_id: u32, envelope: &PeerEnvelope) {
        let frame = match envelope.to_json_string() {
            Ok(frame) => frame,
            Err(error) => {
                log::error(&format!("Couldn't encode a peer frame: {error}"));
                return;
            }
        };
        match self.outboxes.get(&peer_id) {
            Some(outbox) => {
                if outbox.send(frame).is_err() {
                    log::warning(&format!("Peer {peer_id} is gone, dropping the frame."));
                }
            }
            None => log::warning(&format!("No registered socket for peer {peer_id}.")),
        }
    }
}

/// Splits one peer socket into a writer task fed by the outbox and a reader
/// task that tags frames with the peer id and forwards them inbound.
fn register(
    peer_id: u32,
    lines: Framed<TcpStream, LinesCodec>,
    mut outbox_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<(u32, PeerEnvelope)>,
) {
    let (mut writer, mut reader) = lines.split::<String>();

    tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if writer.send(frame).await.is_err() {
                log::warning(&format!("Lost the outbound link to peer {peer_id}."));
                return;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            let line = match frame {
                Ok(line) => line,
                Err(_) => break,
            };
            match PeerEnvelope::from_json_string(&line) {
                Ok(envelope) => {
                    if inbound_tx.send((peer_id, envelope)).is_err() {
                        return;
                    }
                }
                Err(error) => log::warning(&format!(
                    "Discarding an unreadable frame from peer {peer_id}: {error}"
                )),
            }
        }
        log::warning(&format!("Peer {peer_id} disconnected."));
    });
}
