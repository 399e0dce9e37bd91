//! Choosing the endpoint a command is sent to.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::config::{EndpointConfig, ReadPreference, Role};
use crate::{error::MuxError, pubsub::Channel, resp::Command};

/// Number of hash slots keys are distributed over.
pub const SLOT_COUNT: u16 = 16384;

/// Which endpoint a submission goes to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointSelector {
    /// Writes go to a primary, reads follow the configured
    /// [`ReadPreference`].
    #[default]
    Auto,
    /// A primary.
    Primary,
    /// A connected replica if there is one, otherwise a primary.
    PreferReplica,
    /// A replica, connected or not.
    Replica,
    /// The endpoint with this address.
    Address(SocketAddr),
}

/// Hash slot of `key`, honouring `{hashtag}` sections.
///
/// Only the part between the first `{` and the next `}` is hashed when that
/// part is non-empty, so related keys can be kept on one endpoint.
///
/// ```
/// use respmux::hash_slot;
///
/// assert_eq!(hash_slot(b"foo"), 12182);
/// assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"{user1000}.followers"));
/// ```
#[must_use]
pub fn hash_slot(key: &[u8]) -> u16 { crc16(hashtag(key)) % SLOT_COUNT }

fn hashtag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{')
        && let Some(len) = key[open + 1..].iter().position(|&b| b == b'}')
        && len > 0
    {
        return &key[open + 1..open + 1 + len];
    }
    key
}

/// CRC16/XMODEM: polynomial 0x1021, initial value 0.
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0_u16, |mut crc, &byte| {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
        crc
    })
}

#[derive(Clone, Copy)]
enum Target {
    Primary,
    PreferReplica,
    Replica,
}

/// Routes commands and channels to endpoint indices.
#[derive(Debug)]
pub(crate) struct Router {
    endpoints: Vec<EndpointConfig>,
    read_preference: ReadPreference,
    slotted: bool,
    next_replica: AtomicUsize,
}

impl Router {
    pub(crate) fn new(endpoints: Vec<EndpointConfig>, read_preference: ReadPreference) -> Self {
        let slotted = endpoints.iter().any(|e| !e.slots.is_empty());
        Self {
            endpoints,
            read_preference,
            slotted,
            next_replica: AtomicUsize::new(0),
        }
    }

    pub(crate) fn endpoints(&self) -> &[EndpointConfig] { &self.endpoints }

    /// Indices of primary endpoints.
    pub(crate) fn primaries(&self) -> impl Iterator<Item = usize> + '_ {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role == Role::Primary)
            .map(|(i, _)| i)
    }

    /// Pick the endpoint for `command`. `is_up` reports whether an endpoint's
    /// bridge is connected.
    pub(crate) fn route(
        &self,
        selector: EndpointSelector,
        command: &Command,
        is_up: impl Fn(usize) -> bool,
    ) -> Result<usize, MuxError> {
        let slot = if self.slotted {
            command.routing_key().map(hash_slot)
        } else {
            None
        };
        let target = match selector {
            EndpointSelector::Address(addr) => {
                return self
                    .endpoints
                    .iter()
                    .position(|e| e.addr == addr)
                    .ok_or_else(|| MuxError::NoRoute(format!("address {addr}")));
            }
            EndpointSelector::Auto if command.is_read_only() => match self.read_preference {
                ReadPreference::Primary => Target::Primary,
                ReadPreference::PreferReplica => Target::PreferReplica,
                ReadPreference::Replica => Target::Replica,
            },
            EndpointSelector::Auto | EndpointSelector::Primary => Target::Primary,
            EndpointSelector::PreferReplica => Target::PreferReplica,
            EndpointSelector::Replica => Target::Replica,
        };
        let chosen = match target {
            Target::Primary => self.primary(slot),
            Target::Replica => self.replica(slot, &is_up).map(|(i, _)| i),
            Target::PreferReplica => self
                .replica(slot, &is_up)
                .filter(|&(_, up)| up)
                .map(|(i, _)| i)
                .or_else(|| self.primary(slot)),
        };
        chosen.ok_or_else(|| {
            let role = match target {
                Target::Primary | Target::PreferReplica => "primary",
                Target::Replica => "replica",
            };
            match slot {
                Some(slot) => MuxError::NoRoute(format!("a {role} serving slot {slot}")),
                None => MuxError::NoRoute(format!("a {role}")),
            }
        })
    }

    /// The primary whose subscription bridge carries `channel`.
    pub(crate) fn route_channel(&self, channel: &Channel) -> Option<usize> {
        let slot = self.slotted.then(|| hash_slot(channel.name()));
        self.primary(slot)
    }

    fn candidates(&self, role: Role, slot: Option<u16>) -> impl Iterator<Item = usize> + '_ {
        self.endpoints
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.role == role && slot.is_none_or(|slot| e.serves(slot)))
            .map(|(i, _)| i)
    }

    fn primary(&self, slot: Option<u16>) -> Option<usize> {
        self.candidates(Role::Primary, slot).next()
    }

    /// Round-robin over replicas, preferring connected ones. Returns the
    /// index and whether it is connected.
    fn replica(&self, slot: Option<u16>, is_up: &impl Fn(usize) -> bool) -> Option<(usize, bool)> {
        let replicas: Vec<_> = self.candidates(Role::Replica, slot).collect();
        if replicas.is_empty() {
            return None;
        }
        let start = self.next_replica.fetch_add(1, Ordering::Relaxed);
        let rotation = (0..replicas.len())
            .map(|offset| replicas[(start + offset) % replicas.len()]);
        rotation
            .clone()
            .find(|&i| is_up(i))
            .map(|i| (i, true))
            .or_else(|| rotation.clone().next().map(|i| (i, false)))
    }
}
