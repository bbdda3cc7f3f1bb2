//! Subspace — an immutable byte prefix with tuple-packing operations.

use super::Tuple;
use crate::error::RlResult;

/// An immutable byte prefix plus tuple-pack/unpack/range/child operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Pack a tuple onto this subspace's prefix.
    pub fn pack(&self, tuple: &Tuple) -> RlResult<Vec<u8>> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&tuple.pack_bytes()?);
        Ok(out)
    }

    /// Pack a tuple containing one incomplete version-stamp element, for use
    /// with `KvTransaction::set_versionstamped_key`. Returns the full key
    /// bytes and the byte offset of the 12-byte placeholder within them.
    pub fn pack_versionstamped(&self, tuple: &Tuple) -> RlResult<(Vec<u8>, usize)> {
        let packed = tuple.pack()?;
        let offset = packed.incomplete_versionstamp_offset.ok_or_else(|| {
            crate::error::RecordLayerError::UnsupportedElement(
                "pack_versionstamped called on a tuple with no incomplete versionstamp element".into(),
            )
        })?;
        let mut out = self.prefix.clone();
        out.extend_from_slice(&packed.bytes);
        Ok((out, self.prefix.len() + offset))
    }

    /// Recover a tuple from bytes produced by [`Subspace::pack`] on this subspace.
    pub fn unpack(&self, bytes: &[u8]) -> RlResult<Tuple> {
        let suffix = bytes.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            crate::error::RecordLayerError::MalformedTuple(
                "bytes do not start with this subspace's prefix".into(),
            )
        })?;
        Tuple::unpack(suffix)
    }

    /// The half-open key range covering this subspace and every descendant key.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xff);
        (begin, end)
    }

    /// A child subspace keyed by an additional tuple.
    pub fn child(&self, tuple: &Tuple) -> RlResult<Subspace> {
        Ok(Subspace::new(self.pack(tuple)?))
    }

    /// A child subspace keyed by a literal byte suffix (used for fixed path
    /// segments like `R`, `I`, `H` in the store's key layout).
    pub fn child_bytes(&self, suffix: &[u8]) -> Subspace {
        let mut out = self.prefix.clone();
        out.extend_from_slice(suffix);
        Subspace::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Element;

    #[test]
    fn pack_unpack_round_trip() {
        let sub = Subspace::new(b"store1/".to_vec());
        let tuple = Tuple::from_elements(vec![Element::String("x".into()), Element::Int(5)]);
        let packed = sub.pack(&tuple).unwrap();
        assert!(packed.starts_with(b"store1/"));
        let unpacked = sub.unpack(&packed).unwrap();
        assert_eq!(unpacked, tuple);
    }

    #[test]
    fn range_covers_descendants() {
        let sub = Subspace::new(b"p".to_vec());
        let (begin, end) = sub.range();
        let child = sub.child(&Tuple::from_elements(vec![Element::Int(1)])).unwrap();
        let child_key = child.pack(&Tuple::new()).unwrap();
        assert!(child_key.as_slice() > begin.as_slice());
        assert!(child_key.as_slice() < end.as_slice());
    }

    #[test]
    fn pack_versionstamped_reports_placeholder_offset() {
        use crate::tuple::Versionstamp;
        let sub = Subspace::new(b"idx/".to_vec());
        let tuple = Tuple::from_elements(vec![Element::Versionstamp(Versionstamp::Incomplete), Element::Int(7)]);
        let (bytes, offset) = sub.pack_versionstamped(&tuple).unwrap();
        assert_eq!(&bytes[offset..offset + 12], &[0u8; 12]);
        assert!(bytes.starts_with(b"idx/"));
    }

    #[test]
    fn child_extends_prefix() {
        let sub = Subspace::new(b"root".to_vec());
        let child = sub.child_bytes(b"/R/");
        assert_eq!(child.prefix(), b"root/R/");
    }
}
