//! The four endpoint handlers. Every mutation runs between
//! `ask_critical_section` and `release_critical_section`, and the released
//! snapshot is always the post-mutation catalog; `show` never acquires.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ServiceError;
use crate::event::{Event, EventView, Job, User, UserId};
use crate::lamport::Lamport;
use crate::log;
use crate::message::{
    AuthId, EventClose, EventCreate, EventRegister, EventShow, ServerResponse,
};
use crate::protocol::EndpointKind;

/// The replicated catalog. Handlers write it only inside the critical
/// section; the engine's apply callback overwrites it on every `REL`.
pub type Catalog = Arc<RwLock<Vec<Event>>>;

#[derive(Clone)]
pub struct EventService {
    users: Arc<BTreeMap<UserId, User>>,
    catalog: Catalog,
    lamport: Lamport,
    debug: bool,
}

impl EventService {
    pub fn new(
        users: Arc<BTreeMap<UserId, User>>,
        catalog: Catalog,
        lamport: Lamport,
        debug: bool,
    ) -> Self {
        Self {
            users,
            catalog,
            lamport,
            debug,
        }
    }

    pub async fn dispatch(&self, kind: EndpointKind, auth_id: AuthId, payload: &str) -> ServerResponse {
        match kind {
            EndpointKind::Create => match serde_json::from_str::<EventCreate>(payload) {
                Ok(data) => self.create(auth_id, data).await,
                Err(error) => unreadable(kind, error),
            },
            EndpointKind::Show => match serde_json::from_str::<EventShow>(payload) {
                Ok(data) => self.show(data),
                Err(error) => unreadable(kind, error),
            },
            EndpointKind::Close => match serde_json::from_str::<EventClose>(payload) {
                Ok(data) => self.close(auth_id, data).await,
                Err(error) => unreadable(kind, error),
            },
            EndpointKind::Register => match serde_json::from_str::<EventRegister>(payload) {
                Ok(data) => self.register(auth_id, data).await,
                Err(error) => unreadable(kind, error),
            },
        }
    }

    /// Validates outside the critical section, then assigns the id from the
    /// catalog as it stands once the section is granted, so concurrent
    /// creates on different replicas can never collide.
    async fn create(&self, auth_id: AuthId, data: EventCreate) -> ServerResponse {
        if data.name.is_empty() {
            return ServerResponse::failure(ServiceError::NameRequired);
        }
        let mut jobs = BTreeMap::new();
        for (index, job) in data.jobs.iter().enumerate() {
            let id = index as i32 + 1;
            if job.capacity < 1 {
                return ServerResponse::failure(ServiceError::InvalidCapacity);
            }
            if job.name.is_empty() {
                return ServerResponse::failure(ServiceError::NameRequired);
            }
            jobs.insert(
                id,
                Job {
                    id,
                    name: job.name.clone(),
                    capacity: job.capacity,
                },
            );
        }

        self.lamport.ask_critical_section().await;
        let trace = log::CriticalTrace::begin(self.debug, "create").await;
        let view = {
            let mut catalog = self.write_catalog();
            let event = Event {
                id: catalog.len() as i32 + 1,
                name: data.name,
                open: true,
                organizer_id: auth_id,
                jobs,
                participants: BTreeMap::new(),
            };
            let view = EventView::from_event(&event, &self.users);
            catalog.push(event);
            view
        };
        let snapshot = self.snapshot();
        trace.end();
        self.lamport.release_critical_section(snapshot).await;
        ServerResponse::success(&view)
    }

    fn show(&self, data: EventShow) -> ServerResponse {
        let catalog = self.read_catalog();
        if data.event_id != -1 {
            return match catalog.iter().find(|event| event.id == data.event_id) {
                Some(event) => ServerResponse::success(&EventView::from_event(event, &self.users)),
                None => ServerResponse::failure(ServiceError::EventNotFound),
            };
        }
        let views: Vec<EventView> = catalog
            .iter()
            .map(|event| EventView::from_event(event, &self.users))
            .collect();
        ServerResponse::success(&views)
    }

    /// The organizer check needs the catalog, so the section is acquired
    /// first and, on failure, released with the catalog unchanged.
    async fn close(&self, auth_id: AuthId, data: EventClose) -> ServerResponse {
        self.lamport.ask_critical_section().await;
        let trace = log::CriticalTrace::begin(self.debug, "close").await;
        let outcome = {
            let mut catalog = self.write_catalog();
            match catalog.iter_mut().find(|event| event.id == data.event_id) {
                Some(event) => event
                    .close_by(auth_id)
                    .map(|()| EventView::from_event(event, &self.users)),
                None => Err(ServiceError::EventNotFound),
            }
        };
        let snapshot = self.snapshot();
        trace.end();
        self.lamport.release_critical_section(snapshot).await;
        match outcome {
            Ok(view) => ServerResponse::success(&view),
            Err(error) => ServerResponse::failure(error),
        }
    }

    async fn register(&self, auth_id: AuthId, data: EventRegister) -> ServerResponse {
        self.lamport.ask_critical_section().await;
        let trace = log::CriticalTrace::begin(self.debug, "register").await;
        let outcome = {
            let mut catalog = self.write_catalog();
            match catalog.iter_mut().find(|event| event.id == data.event_id) {
                Some(event) => event
                    .register(auth_id, data.job_id)
                    .map(|()| EventView::from_event(event, &self.users)),
                None => Err(ServiceError::EventNotFound),
            }
        };
        let snapshot = self.snapshot();
        trace.end();
        self.lamport.release_critical_section(snapshot).await;
        match outcome {
            Ok(view) => ServerResponse::success(&view),
            Err(error) => ServerResponse::failure(error),
        }
    }

    fn read_catalog(&self) -> RwLockReadGuard<'_, Vec<Event>> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_catalog(&self) -> RwLockWriteGuard<'_, Vec<Event>> {
        self.catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<Event> {
        self.read_catalog().clone()
    }
}

fn unreadable(kind: EndpointKind, error: serde_json::Error) -> ServerResponse {
    log::warning(&format!(
        "Unreadable {} payload: {error}",
        kind.name()
    ));
    ServerResponse::failure_text("invalid request payload")
}
