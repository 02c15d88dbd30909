use thiserror::Error;

/// Every failure a client can see in a response. The display strings are the
/// wire format; clients match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("name is required")]
    NameRequired,
    #[error("capacity must be greater than 0")]
    InvalidCapacity,
    #[error("event not found")]
    EventNotFound,
    #[error("job not found")]
    JobNotFound,
    #[error("you are not the organizer")]
    NotOrganizer,
    #[error("event already closed")]
    EventAlreadyClosed,
    #[error("event is closed")]
    EventClosed,
    #[error("job is full")]
    JobFull,
}
