//! Distributed mutual exclusion over the peer mesh, Ricart–Agrawala style.
//!
//! A replica that wants to mutate the catalog broadcasts `REQ` stamped with
//! its logical clock and waits for an `ACK` from every peer. A peer answers
//! immediately unless it holds the section or wants it with a better
//! priority, in which case the `ACK` is deferred until its own release.
//! `REL` carries the full catalog, which every receiver applies as the new
//! authoritative state; it goes out before the deferred `ACK`s so that a
//! peer granted by one of those `ACK`s has already seen the catalog it is
//! about to extend.
//!
//! Priorities are `(clock, peer id)` compared lexicographically, smaller
//! wins. Clocks never repeat across competing requests, so requests are
//! served in priority order and nobody starves.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};

use crate::event::Event;
use crate::log;
use crate::message::{PeerEnvelope, PeerMessageKind};
use crate::peers::{PeerFrames, PeerNetwork};

/// Request priority; the tie on equal clocks goes to the smaller peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    pub clock: u64,
    pub peer: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Wanted,
    Held,
}

/// What absorbing one peer frame asks of the caller.
#[derive(Debug, Default)]
pub struct Absorbed {
    /// An `ACK` to send back to the frame's sender.
    pub reply: Option<PeerEnvelope>,
    /// The local request just collected its last `ACK`.
    pub granted: bool,
}

/// The protocol state machine, free of any I/O so it can be driven directly
/// in tests. The engine below wraps it with the transport and the waiters.
pub struct MutexCore {
    my_id: u32,
    peer_ids: Vec<u32>,
    clock: u64,
    mode: Mode,
    my_request: Option<Priority>,
    /// Peers whose `REQ` we owe an `ACK`, keyed by peer id.
    deferred: BTreeMap<u32, Priority>,
    acked: HashSet<u32>,
}

impl MutexCore {
    pub fn new(my_id: u32, peer_ids: Vec<u32>) -> Self {
        Self {
            my_id,
            peer_ids,
            clock: 0,
            mode: Mode::Idle,
            my_request: None,
            deferred: BTreeMap::new(),
            acked: HashSet::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Starts a local acquisition. Returns the `REQ` to broadcast, or `None`
    /// when there are no peers and the section is held on the spot.
    pub fn begin_request(&mut self) -> Option<PeerEnvelope> {
        self.clock += 1;
        self.my_request = Some(Priority {
            clock: self.clock,
            peer: self.my_id,
        });
        self.acked.clear();
        if self.peer_ids.is_empty() {
            self.mode = Mode::Held;
            None
        } else {
            self.mode = Mode::Wanted;
            Some(PeerEnvelope::request(self.my_id, self.clock))
        }
    }

    /// Ends the held section. Returns the `REL` to broadcast and the deferred
    /// `ACK`s to send afterwards, in that order.
    pub fn end_request(&mut self, catalog: Vec<Event>) -> (PeerEnvelope, Vec<(u32, PeerEnvelope)>) {
        self.mode = Mode::Idle;
        self.my_request = None;
        let release = PeerEnvelope::release(self.my_id, self.clock, catalog);
        let acks = self
            .deferred
            .keys()
            .map(|peer| (*peer, PeerEnvelope::acknowledge(self.my_id, self.clock)))
            .collect();
        self.deferred.clear();
        (release, acks)
    }

    /// Absorbs one peer frame, bumping the clock. `REL` payloads are the
    /// caller's to apply.
    pub fn absorb(&mut self, peer: u32, envelope: &PeerEnvelope) -> Absorbed {
        self.clock = self.clock.max(envelope.clock) + 1;
        match envelope.kind {
            PeerMessageKind::Request => {
                let theirs = Priority {
                    clock: envelope.clock,
                    peer,
                };
                let defer = match self.mode {
                    Mode::Held => true,
                    Mode::Wanted => match self.my_request {
                        Some(mine) => mine < theirs,
                        None => false,
                    },
                    Mode::Idle => false,
                };
                if defer {
                    self.deferred.insert(peer, theirs);
                    Absorbed::default()
                } else {
                    Absorbed {
                        reply: Some(PeerEnvelope::acknowledge(self.my_id, self.clock)),
                        granted: false,
                    }
                }
            }
            PeerMessageKind::Acknowledge => {
                if self.mode == Mode::Wanted {
                    self.acked.insert(peer);
                    if self.peer_ids.iter().all(|peer| self.acked.contains(peer)) {
                        self.mode = Mode::Held;
                        return Absorbed {
                            reply: None,
                            granted: true,
                        };
                    }
                }
                Absorbed::default()
            }
            PeerMessageKind::Release => {
                // a REQ from this peer cannot be pending here once it
                // releases, but clearing is harmless
                self.deferred.remove(&peer);
                Absorbed::default()
            }
        }
    }
}

/// Applies a catalog received on `REL`; must not block.
pub type ApplyFn = Box<dyn Fn(Vec<Event>) + Send + Sync>;

struct EngineState {
    core: MutexCore,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// The engine proper: [`MutexCore`] plus the transport, the catalog apply
/// callback and the queue of blocked acquirers.
#[derive(Clone)]
pub struct Lamport {
    shared: Arc<Shared>,
}

struct Shared {
    network: PeerNetwork,
    state: Mutex<EngineState>,
    apply: ApplyFn,
}

impl Lamport {
    pub fn new(network: PeerNetwork, apply: ApplyFn) -> Self {
        let core = MutexCore::new(network.my_id(), network.peer_ids());
        Self {
            shared: Arc::new(Shared {
                network,
                state: Mutex::new(EngineState {
                    core,
                    waiters: VecDeque::new(),
                }),
                apply,
            }),
        }
    }

    /// Blocks the caller until this replica holds the critical section.
    pub async fn ask_critical_section(&self) {
        let waiter = {
            let mut state = self.shared.state.lock().await;
            match state.core.begin_request() {
                Some(request) => {
                    self.shared.network.broadcast(&request);
                    let (waiter_tx, waiter_rx) = oneshot::channel();
                    state.waiters.push_back(waiter_tx);
                    Some(waiter_rx)
                }
                // no peers: held on the spot
                None => None,
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }
    }

    /// Leaves the critical section, propagating `catalog` as the new
    /// authoritative state and answering every deferred request.
    pub async fn release_critical_section(&self, catalog: Vec<Event>) {
        let mut state = self.shared.state.lock().await;
        let (release, acks) = state.core.end_request(catalog);
        self.shared.network.broadcast(&release);
        for (peer, ack) in acks {
            self.shared.network.send_to(peer, &ack);
        }
    }

    /// Drains peer frames until the transport goes away or shutdown flips.
    /// This is the only task that touches the core for inbound traffic.
    pub async fn run(self, mut frames: PeerFrames, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (peer, mut envelope) = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let mut state = self.shared.state.lock().await;
            let absorbed = state.core.absorb(peer, &envelope);
            if let Some(catalog) = envelope.payload.take() {
                (self.shared.apply)(catalog);
            }
            if let Some(reply) = absorbed.reply {
                self.shared.network.send_to(peer, &reply);
            }
            if absorbed.granted {
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => log::warning("The critical section was granted with nobody waiting."),
                }
            }
        }
        log::info("Mutual-exclusion engine stopped.");
    }
}
