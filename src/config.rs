//! The addressbook: `PeerId -> SocketAddr`. A configuration surface, not
//! a protocol surface (spec.md §6) — peers never exchange it, they each
//! start from the same book (the hard-coded default or a YAML override)
//! and learn who's on the other end of a connection from the handshake.

use crate::message::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The number of peers in the default deployment.
pub const DEFAULT_COUNCIL_SIZE: u8 = 9;

/// The first port in the default `localhost:8001..8009` range.
pub const DEFAULT_BASE_PORT: u16 = 8001;

/// One entry in an addressbook file.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Entry {
    pub id: PeerId,
    pub address: SocketAddr,
}

/// The full map of every council member's address, known identically by
/// every peer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Addressbook(BTreeMap<PeerId, SocketAddr>);

impl Addressbook {
    /// The default nine-peer book: peers 1..9 on `localhost:8001..8009`.
    #[must_use]
    pub fn default_book() -> Self {
        let mut book = BTreeMap::new();
        for offset in 0..DEFAULT_COUNCIL_SIZE {
            let id = offset + 1;
            let port = DEFAULT_BASE_PORT + u16::from(offset);
            book.insert(
                id,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            );
        }
        Addressbook(book)
    }

    /// Parse a YAML list of `{id, address}` entries into an addressbook.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure if `config` is not
    /// valid YAML or contains a field the format doesn't recognize.
    pub fn parse(config: &str) -> Result<Self, String> {
        let entries: Vec<Entry> = serde_yaml::from_str(config).map_err(|err| err.to_string())?;
        let mut book = BTreeMap::new();
        for entry in entries {
            book.insert(entry.id, entry.address);
        }
        Ok(Addressbook(book))
    }

    /// The configured number of council members, `N` in spec.md's
    /// notation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The majority quorum size for this council: `floor(N/2) + 1`.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.len() / 2 + 1
    }

    /// Look up a single peer's address.
    #[must_use]
    pub fn address_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.0.get(&id).copied()
    }

    /// Iterate over every peer other than `excluding`, in ascending id
    /// order.
    pub fn peers_excluding(&self, excluding: PeerId) -> impl Iterator<Item = (PeerId, SocketAddr)> + '_ {
        self.0
            .iter()
            .filter(move |(id, _)| **id != excluding)
            .map(|(id, addr)| (*id, *addr))
    }

    /// All configured peer ids, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.0.keys().copied()
    }
}
