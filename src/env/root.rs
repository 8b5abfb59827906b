use std::collections::BTreeMap;

use crate::primitives::bytes::{buf, var};
use crate::primitives::log::{Loggable, RecordKind};
use crate::types::{Address, EnvError, Result, StructureId};

/// One published version of the whole environment.
///
/// Maps every non-empty tree, the meta tree included, to its root record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseRoot {
    address: Option<Address>,
    sequence: u64,
    timestamp_ms: u64,
    next_structure_id: StructureId,
    trees: BTreeMap<StructureId, Address>,
}

impl DatabaseRoot {
    /// The version of an environment nothing was ever committed to.
    pub(crate) fn initial() -> Self {
        Self {
            address: None,
            sequence: 0,
            timestamp_ms: 0,
            next_structure_id: StructureId::FIRST_USER,
            trees: BTreeMap::new(),
        }
    }

    /// Address of the record this root was read from or written to.
    pub fn address(&self) -> Option<Address> {
        self.address
    }

    /// Commit sequence number, 0 for the initial root.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Commit time in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Lowest structure id not yet handed to a store.
    pub fn next_structure_id(&self) -> StructureId {
        self.next_structure_id
    }

    /// Root address of tree `structure_id`, `None` when it is empty.
    pub fn root_of(&self, structure_id: StructureId) -> Option<Address> {
        self.trees.get(&structure_id).copied()
    }

    /// Number of non-empty trees.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Overlays `updates` onto this root; `None` removes a tree.
    pub(crate) fn advance(
        &self,
        updates: impl IntoIterator<Item = (StructureId, Option<Address>)>,
        next_structure_id: StructureId,
        timestamp_ms: u64,
    ) -> Self {
        let mut trees = self.trees.clone();
        for (structure_id, root) in updates {
            match root {
                Some(address) => {
                    trees.insert(structure_id, address);
                }
                None => {
                    trees.remove(&structure_id);
                }
            }
        }
        Self {
            address: None,
            sequence: self.sequence + 1,
            timestamp_ms,
            next_structure_id: next_structure_id.max(self.next_structure_id),
            trees,
        }
    }

    pub(crate) fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * var::MAX_LEN + self.trees.len() * 16);
        var::encode_u64(self.sequence, &mut out);
        var::encode_u64(self.timestamp_ms, &mut out);
        var::encode_u64(self.next_structure_id.0, &mut out);
        var::encode_u64(self.trees.len() as u64, &mut out);
        for (structure_id, address) in &self.trees {
            var::encode_u64(structure_id.0, &mut out);
            out.extend_from_slice(&address.0.to_be_bytes());
        }
        out
    }

    pub(crate) fn decode(record: &Loggable) -> Result<Self> {
        if record.kind != RecordKind::DatabaseRoot {
            return Err(EnvError::Corruption("record is not a database root"));
        }
        let mut reader = buf::Reader::new(&record.payload);
        let sequence = reader.varint()?;
        let timestamp_ms = reader.varint()?;
        let next_structure_id = StructureId(reader.varint()?);
        let count = reader.varint_len()?;
        let mut trees = BTreeMap::new();
        let mut previous: Option<StructureId> = None;
        for _ in 0..count {
            let structure_id = StructureId(reader.varint()?);
            if previous.is_some_and(|p| p >= structure_id) {
                return Err(EnvError::Corruption("database root trees out of order"));
            }
            let address = Address(reader.u64_be()?);
            if address >= record.address {
                return Err(EnvError::Corruption("database root points forward"));
            }
            trees.insert(structure_id, address);
            previous = Some(structure_id);
        }
        reader.finish()?;
        Ok(Self {
            address: Some(record.address),
            sequence,
            timestamp_ms,
            next_structure_id,
            trees,
        })
    }
}
