//! The fixed on-disk key layout.
//!
//! Everything the runtime persists lives under three sibling namespaces of a
//! root subspace:
//!
//! - records at `[root]/"R"/<type>/<id...>`,
//! - index entries at `[root]/"I"/<subspace_key>/<values...>/<id...>`,
//! - metadata at a dedicated metadata subspace: the schema version, one
//!   state byte per index, former-index tombstones and online-build cursors.
//!
//! The single-character segments `R` and `I` are a compatibility commitment;
//! they are never renamed.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    schema::Version,
    tuple::{Tuple, TupleElement},
    Error, Result, Subspace,
};

/// Segment under which records are stored. Preserved verbatim for layout
/// compatibility.
pub const RECORD_SEGMENT: &str = "R";
/// Segment under which index entries are stored. Preserved verbatim.
pub const INDEX_SEGMENT: &str = "I";
/// Segment naming the metadata namespace in the multi-tenant layout.
pub const METADATA_SEGMENT: &str = "_metadata";
/// Fixed prefix of the metadata namespace in the shared layout.
pub const SHARED_METADATA_PREFIX: u8 = 0xFE;

/// Key builders for the record and index namespaces under one root.
#[derive(Debug, Clone)]
pub struct KeySpace {
    root: Subspace,
}

impl KeySpace {
    /// Creates the layout for a namespace root.
    pub fn new(root: Subspace) -> Self {
        Self { root }
    }

    /// The namespace root.
    pub fn root(&self) -> &Subspace {
        &self.root
    }

    /// The subspace holding all records of `type_name`.
    pub fn record_subspace(&self, type_name: &str) -> Subspace {
        self.root
            .subspace(&Tuple::from_elements(vec![
                TupleElement::String(RECORD_SEGMENT.into()),
                TupleElement::String(type_name.into()),
            ]))
    }

    /// The key of the record `(type_name, id)`.
    pub fn record_key(&self, type_name: &str, id: &Tuple) -> Vec<u8> {
        self.record_subspace(type_name).pack(id)
    }

    /// The record key for an already-packed id.
    pub fn record_key_raw(&self, type_name: &str, packed_id: &[u8]) -> Vec<u8> {
        let mut key = self.record_subspace(type_name).prefix().to_vec();
        key.extend_from_slice(packed_id);
        key
    }

    /// The subspace holding all index entries of this namespace.
    pub fn index_root(&self) -> Subspace {
        self.root
            .subspace(&Tuple::from_element(INDEX_SEGMENT))
    }

    /// The subspace holding all entries of the index with `subspace_key`.
    pub fn index_subspace(&self, subspace_key: &str) -> Subspace {
        self.root
            .subspace(&Tuple::from_elements(vec![
                TupleElement::String(INDEX_SEGMENT.into()),
                TupleElement::String(subspace_key.into()),
            ]))
    }
}

/// Key builders for the metadata namespace.
#[derive(Debug, Clone)]
pub struct MetadataSpace {
    subspace: Subspace,
}

impl MetadataSpace {
    /// Wraps the metadata subspace chosen at container construction.
    pub fn new(subspace: Subspace) -> Self {
        Self { subspace }
    }

    /// The metadata subspace itself.
    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    /// Key holding the stored schema version.
    pub fn version_key(&self) -> Vec<u8> {
        self.subspace.pack_slice(&[
            TupleElement::String("schema".into()),
            TupleElement::String("version".into()),
        ])
    }

    /// Key holding the state byte of the named index.
    pub fn state_key(&self, index_name: &str) -> Vec<u8> {
        self.subspace.pack_slice(&[
            TupleElement::String("state".into()),
            TupleElement::String(index_name.into()),
        ])
    }

    /// Key holding the online-build cursor of the named index.
    pub fn progress_key(&self, index_name: &str) -> Vec<u8> {
        self.subspace.pack_slice(&[
            TupleElement::String("progress".into()),
            TupleElement::String(index_name.into()),
        ])
    }

    /// Key holding the tombstone of a removed index.
    pub fn former_index_key(&self, index_name: &str) -> Vec<u8> {
        self.subspace.pack_slice(&[
            TupleElement::String("formerIndexes".into()),
            TupleElement::String(index_name.into()),
        ])
    }
}

/// Encodes a schema version as the stored three-integer tuple.
pub fn encode_version(version: Version) -> Vec<u8> {
    Tuple::from_elements(vec![
        TupleElement::Int(i64::from(version.major)),
        TupleElement::Int(i64::from(version.minor)),
        TupleElement::Int(i64::from(version.patch)),
    ])
    .pack()
}

/// Decodes a stored schema version.
///
/// Accepts the native integer element shape and the legacy shape where each
/// component is an 8-byte little-endian unsigned integer stored as a byte
/// string. A tuple of any length other than three is a broken invariant.
pub fn decode_version(bytes: &[u8]) -> Result<Version> {
    let tuple = Tuple::unpack(bytes)?;
    let elements = tuple.elements();
    if elements.len() != 3 {
        return Err(Error::Internal(format!(
            "stored schema version has {} elements, expected 3",
            elements.len()
        )));
    }
    let mut parts = [0_u32; 3];
    for (slot, element) in parts.iter_mut().zip(elements) {
        *slot = decode_version_component(element)?;
    }
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

fn decode_version_component(element: &TupleElement) -> Result<u32> {
    let wide = match element {
        TupleElement::Int(value) => *value,
        // Legacy writers stored each component in the 64-bit atomic-op
        // register format.
        TupleElement::Bytes(raw) if raw.len() == 8 => {
            i64::try_from(LittleEndian::read_u64(raw))
                .map_err(|_| Error::Internal("stored version component out of range".into()))?
        }
        other => {
            return Err(Error::Internal(format!(
                "stored version component has unexpected shape: {other:?}"
            )))
        }
    };
    u32::try_from(wide)
        .map_err(|_| Error::Internal("stored version component out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyspace() -> KeySpace {
        KeySpace::new(Subspace::from_bytes(vec![0x15, 0x09]))
    }

    #[test]
    fn record_key_layout_is_root_r_type_id() {
        let ks = keyspace();
        let id = Tuple::from_element("01H");
        let key = ks.record_key("User", &id);
        let tuple = ks.root().unpack(&key).unwrap();
        assert_eq!(
            tuple.elements(),
            &[
                TupleElement::String("R".into()),
                TupleElement::String("User".into()),
                TupleElement::String("01H".into()),
            ]
        );
    }

    #[test]
    fn raw_and_tuple_record_keys_agree() {
        let ks = keyspace();
        let id = Tuple::from_element(7_i64);
        assert_eq!(
            ks.record_key("Order", &id),
            ks.record_key_raw("Order", &id.pack())
        );
    }

    #[test]
    fn index_subspace_sits_under_i_segment() {
        let ks = keyspace();
        let sub = ks.index_subspace("idx_email");
        let tail = ks.root().unpack(sub.prefix()).unwrap();
        assert_eq!(
            tail.elements(),
            &[
                TupleElement::String("I".into()),
                TupleElement::String("idx_email".into()),
            ]
        );
    }

    #[test]
    fn metadata_keys_use_the_documented_segments() {
        let meta = MetadataSpace::new(Subspace::from_bytes(vec![SHARED_METADATA_PREFIX]));
        let sub = meta.subspace().clone();
        for (key, segments) in [
            (meta.version_key(), vec!["schema", "version"]),
            (meta.state_key("idx"), vec!["state", "idx"]),
            (meta.progress_key("idx"), vec!["progress", "idx"]),
            (meta.former_index_key("idx"), vec!["formerIndexes", "idx"]),
        ] {
            let tuple = sub.unpack(&key).unwrap();
            let expected: Vec<TupleElement> = segments
                .into_iter()
                .map(|s| TupleElement::String(s.into()))
                .collect();
            assert_eq!(tuple.elements(), expected.as_slice());
        }
    }

    #[test]
    fn version_roundtrips_in_native_shape() {
        let version = Version::new(2, 11, 3);
        assert_eq!(decode_version(&encode_version(version)).unwrap(), version);
    }

    #[test]
    fn version_accepts_legacy_64bit_components() {
        let mut legacy = Vec::new();
        for component in [1_u64, 4, 9] {
            let mut raw = [0; 8];
            LittleEndian::write_u64(&mut raw, component);
            legacy.push(TupleElement::Bytes(raw.to_vec()));
        }
        let bytes = Tuple::from_elements(legacy).pack();
        assert_eq!(decode_version(&bytes).unwrap(), Version::new(1, 4, 9));
    }

    #[test]
    fn short_version_tuple_is_an_internal_error() {
        let bytes = Tuple::from_elements(vec![TupleElement::Int(1), TupleElement::Int(2)]).pack();
        assert!(matches!(decode_version(&bytes), Err(Error::Internal(_))));
    }
}
