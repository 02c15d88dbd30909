//! The replicated domain: users, events, jobs and the registration rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ServiceError;

pub type UserId = i32;
pub type EventId = i32;
pub type JobId = i32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub capacity: i32,
}

/// One entry of the replicated catalog. `participants` maps a user to the
/// single job they hold within this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub open: bool,
    pub organizer_id: UserId,
    pub jobs: BTreeMap<JobId, Job>,
    pub participants: BTreeMap<UserId, JobId>,
}

impl Event {
    /// How many users currently hold the given job.
    pub fn occupancy(&self, job: JobId) -> usize {
        self.participants
            .values()
            .filter(|assigned| **assigned == job)
            .count()
    }

    /// Registers `user` for `job`, replacing any previous registration of the
    /// same user. The caller's previous slot is freed before the capacity
    /// check, so switching jobs works even on an otherwise full event.
    pub fn register(&mut self, user: UserId, job: JobId) -> Result<(), ServiceError> {
        if !self.open {
            return Err(ServiceError::EventClosed);
        }
        let capacity = match self.jobs.get(&job) {
            Some(found) => found.capacity as usize,
            None => return Err(ServiceError::JobNotFound),
        };
        let occupied = self
            .participants
            .iter()
            .filter(|(holder, assigned)| **assigned == job && **holder != user)
            .count();
        if occupied >= capacity {
            return Err(ServiceError::JobFull);
        }
        self.participants.insert(user, job);
        Ok(())
    }

    /// Closes the event. Only the organizer may do this, and only once.
    pub fn close_by(&mut self, caller: UserId) -> Result<(), ServiceError> {
        if self.organizer_id != caller {
            return Err(ServiceError::NotOrganizer);
        }
        if !self.open {
            return Err(ServiceError::EventAlreadyClosed);
        }
        self.open = false;
        Ok(())
    }
}

/// A user as exposed to clients: never carries the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub capacity: i32,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user: UserSummary,
    pub job_id: JobId,
}

/// The response shape of an event, with user ids resolved against the user
/// table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventView {
    pub id: EventId,
    pub name: String,
    pub open: bool,
    pub organizer: UserSummary,
    pub jobs: Vec<JobView>,
    pub participants: Vec<ParticipantView>,
}

impl EventView {
    pub fn from_event(event: &Event, users: &BTreeMap<UserId, User>) -> Self {
        let jobs = event
            .jobs
            .values()
            .map(|job| JobView {
                id: job.id,
                name: job.name.clone(),
                capacity: job.capacity,
                count: event.occupancy(job.id),
            })
            .collect();
        let participants = event
            .participants
            .iter()
            .map(|(user, job)| ParticipantView {
                user: summarize(*user, users),
                job_id: *job,
            })
            .collect();
        Self {
            id: event.id,
            name: event.name.clone(),
            open: event.open,
            organizer: summarize(event.organizer_id, users),
            jobs,
            participants,
        }
    }
}

fn summarize(id: UserId, users: &BTreeMap<UserId, User>) -> UserSummary {
    match users.get(&id) {
        Some(user) => UserSummary {
            id: user.id,
            username: user.username.clone(),
        },
        None => UserSummary {
            id,
            username: String::new(),
        },
    }
}
