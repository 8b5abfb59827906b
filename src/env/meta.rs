use crate::primitives::bytes::{buf, var};
use crate::types::{EnvError, Result, StructureId};

const FLAG_DUPLICATES: u8 = 0b01;
const FLAG_TEMPORARY: u8 = 0b10;

/// Settings of one store, kept in the meta tree under the store's name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TreeMetaInfo {
    /// Identity of the store's tree.
    pub structure_id: StructureId,
    /// Whether the store keeps several values per key.
    pub duplicates: bool,
    /// Marks the stand-in handed out for missing stores in read-only mode.
    pub temporary: bool,
}

impl TreeMetaInfo {
    /// Meta info of the meta tree itself.
    pub const META_TREE: TreeMetaInfo = TreeMetaInfo {
        structure_id: StructureId::META,
        duplicates: false,
        temporary: false,
    };

    pub(crate) fn temporary(duplicates: bool) -> Self {
        Self {
            structure_id: StructureId::TEMPORARY,
            duplicates,
            temporary: true,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(var::MAX_LEN + 1);
        var::encode_u64(self.structure_id.0, &mut out);
        let mut flags = 0u8;
        if self.duplicates {
            flags |= FLAG_DUPLICATES;
        }
        if self.temporary {
            flags |= FLAG_TEMPORARY;
        }
        out.push(flags);
        out
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = buf::Reader::new(src);
        let structure_id = StructureId(reader.varint()?);
        let flags = reader.u8()?;
        reader.finish()?;
        if flags & !(FLAG_DUPLICATES | FLAG_TEMPORARY) != 0 {
            return Err(EnvError::Corruption("unknown store meta flags"));
        }
        Ok(Self {
            structure_id,
            duplicates: flags & FLAG_DUPLICATES != 0,
            temporary: flags & FLAG_TEMPORARY != 0,
        })
    }
}
