//! Savepoints as positions in the replay log.
//!
//! The backend has no savepoint support. Rolling back to a savepoint
//! truncates the replay log; if writes already sent to the backend are cut
//! off, the transaction restarts and replays what is left.

use std::collections::HashSet;
use std::fmt;

use crate::error::ConnectionError;
use crate::session::id::{SavepointId, SavepointIdGenerator};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Savepoint {
    Named(String),
    Unnamed(SavepointId),
}

impl fmt::Display for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Savepoint::Named(name) => f.write_str(name),
            Savepoint::Unnamed(id) => write!(f, "#{id}"),
        }
    }
}

#[derive(Debug)]
struct Marker {
    savepoint: Savepoint,
    log_index: usize,
}

#[derive(Debug, Default)]
pub struct SavepointManager {
    markers: Vec<Marker>,
    retired: HashSet<Savepoint>,
    ids: SavepointIdGenerator,
}

impl SavepointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a savepoint at the current end of the replay log.
    pub fn set(
        &mut self,
        name: Option<&str>,
        log_len: usize,
    ) -> Result<Savepoint, ConnectionError> {
        let savepoint = match name {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConnectionError::InvalidArgument(
                        "savepoint name must not be empty".to_string(),
                    ));
                }
                let savepoint = Savepoint::Named(name.to_string());
                if self.position(&savepoint).is_some() {
                    return Err(ConnectionError::InvalidArgument(format!(
                        "savepoint {name} already exists"
                    )));
                }
                self.retired.remove(&savepoint);
                savepoint
            }
            None => Savepoint::Unnamed(self.ids.next()),
        };
        self.markers.push(Marker {
            savepoint: savepoint.clone(),
            log_index: log_len,
        });
        Ok(savepoint)
    }

    /// Invalidates every savepoint set after `savepoint` and returns the log
    /// length to truncate to. The target itself stays valid.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<usize, ConnectionError> {
        let index = self.require(savepoint)?;
        let log_index = self.markers[index].log_index;
        self.retire_from(index + 1);
        Ok(log_index)
    }

    /// Removes `savepoint` and every savepoint set after it.
    pub fn release(&mut self, savepoint: &Savepoint) -> Result<(), ConnectionError> {
        let index = self.require(savepoint)?;
        self.retire_from(index);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn position(&self, savepoint: &Savepoint) -> Option<usize> {
        self.markers
            .iter()
            .position(|marker| marker.savepoint == *savepoint)
    }

    fn require(&self, savepoint: &Savepoint) -> Result<usize, ConnectionError> {
        if let Some(index) = self.position(savepoint) {
            return Ok(index);
        }
        let issued = match savepoint {
            Savepoint::Named(_) => self.retired.contains(savepoint),
            Savepoint::Unnamed(id) => self.ids.issued(*id),
        };
        if issued {
            Err(ConnectionError::InvalidArgument(format!(
                "savepoint {savepoint} is no longer valid"
            )))
        } else {
            Err(ConnectionError::InvalidArgument(format!(
                "unknown savepoint {savepoint}"
            )))
        }
    }

    fn retire_from(&mut self, index: usize) {
        for marker in self.markers.drain(index..) {
            self.retired.insert(marker.savepoint);
        }
    }
}
