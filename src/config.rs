//! Startup configuration, shared by every replica of a deployment and loaded
//! from a JSON file. The replica id selects one entry of `servers`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::Path;

use crate::event::{Event, User, UserId};

/// The two addresses one replica listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerUrl {
    pub client: String,
    pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWithPassword {
    pub id: UserId,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaConfig {
    /// Index of this replica in `servers`; not part of the file, every
    /// replica shares the same file and passes its own id on the command
    /// line.
    #[serde(skip)]
    pub id: u32,
    pub servers: Vec<ServerUrl>,
    pub users: Vec<UserWithPassword>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub show_infos_logs: bool,
}

impl ReplicaConfig {
    pub fn load(path: impl AsRef<Path>, id: u32) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.id = id;
        config.current_urls()?;
        Ok(config)
    }

    pub fn current_urls(&self) -> Result<&ServerUrl, Box<dyn Error + Send + Sync>> {
        self.servers
            .get(self.id as usize)
            .ok_or_else(|| format!("replica id {} is not in the servers list", self.id).into())
    }

    /// Every other replica as (peer id, inter-server address).
    pub fn other_servers(&self) -> Vec<(u32, String)> {
        self.servers
            .iter()
            .enumerate()
            .filter(|(index, _)| *index as u32 != self.id)
            .map(|(index, url)| (index as u32, url.server.clone()))
            .collect()
    }

    pub fn user_table(&self) -> BTreeMap<UserId, User> {
        self.users
            .iter()
            .map(|user| {
                (
                    user.id,
                    User {
                        id: user.id,
                        username: user.username.clone(),
                        password: user.password.clone(),
                    },
                )
            })
            .collect()
    }

    /// Events seeded in the configuration become the catalog at startup.
    pub fn initial_events(&self) -> Vec<Event> {
        self.events.clone()
    }
}
