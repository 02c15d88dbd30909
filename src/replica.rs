//! One running replica: the peer mesh, the mutual-exclusion engine, the
//! client listener and the dispatcher, owned together behind a stop handle.

use color_print::cformat;
use std::error::Error;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ReplicaConfig;
use crate::event::Event;
use crate::lamport::{ApplyFn, Lamport};
use crate::log;
use crate::peers::PeerNetwork;
use crate::protocol::{self, dispatch_channel};
use crate::service::{Catalog, EventService};

pub struct Replica {
    shutdown: watch::Sender<bool>,
}

impl Replica {
    /// Brings the replica up. Blocks until the peer mesh is complete, then
    /// returns once the client listener is accepting.
    pub async fn start(config: ReplicaConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        log::set_enabled(config.show_infos_logs);
        log::info(&format!("Debug mode: {}.", config.debug));

        let urls = config.current_urls()?.clone();
        let peer_listener = TcpListener::bind(&urls.server).await?;
        let (network, frames) =
            PeerNetwork::connect(config.id, peer_listener, &config.other_servers()).await?;

        let users = Arc::new(config.user_table());
        let catalog: Catalog = Arc::new(RwLock::new(config.initial_events()));

        let (shutdown, _) = watch::channel(false);

        let apply: ApplyFn = {
            let catalog = catalog.clone();
            Box::new(move |events: Vec<Event>| {
                *catalog
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = events;
                log::info("Applied a replicated catalog update.");
            })
        };
        let lamport = Lamport::new(network, apply);
        tokio::spawn(lamport.clone().run(frames, shutdown.subscribe()));

        let service = EventService::new(users.clone(), catalog, lamport, config.debug);
        let (queue, jobs) = dispatch_channel();
        tokio::spawn(protocol::process_requests(service, jobs, shutdown.subscribe()));

        let client_listener = TcpListener::bind(&urls.client).await?;
        log::success(&cformat!(
            "Server started on <bold>{}</bold>.",
            urls.client
        ));

        tokio::spawn({
            let mut shutdown = shutdown.subscribe();
            async move {
                loop {
                    tokio::select! {
                        accepted = client_listener.accept() => match accepted {
                            Ok((stream, address)) => {
                                log::info(&format!("New connection from {address}."));
                                tokio::spawn(protocol::handle_connection(
                                    stream,
                                    users.clone(),
                                    queue.clone(),
                                ));
                            }
                            Err(error) => {
                                log::error(&format!("Error while accepting a client: {error}"));
                                break;
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                log::info("Client listener stopped.");
            }
        });

        Ok(Self { shutdown })
    }

    /// Closes both listeners and stops the engine and the dispatcher.
    /// In-flight critical-section acquisitions are not waited for.
    pub fn stop(&self) {
        log::info("Stopping the server.");
        let _ = self.shutdown.send(true);
    }
}
