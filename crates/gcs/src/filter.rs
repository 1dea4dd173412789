use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::{deserialize_partial, serialize};
use bitcoin::hashes::siphash24;

use cinder_primitives::buf::Buf32;
use cinder_primitives::filter::FilterType;
use cinder_primitives::hash;

use crate::bits::{BitReader, BitWriter};
use crate::GcsError;

/// Consensus cap on the element count, matching the BIP-158 limit on
/// filter contents.
const MAX_ELEMENTS: u64 = 1 << 32;

/// SipHash-2-4 key for a filter, the first 16 bytes of the block hash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GcsKey([u8; 16]);

impl GcsKey {
    pub fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    pub fn from_block_hash(hash: &Buf32) -> Self {
        let mut key = [0u8; 16];
        key.copy_from_slice(&hash.as_slice()[..16]);
        Self(key)
    }

    fn k0(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("gcs: key half"))
    }

    fn k1(&self) -> u64 {
        u64::from_le_bytes(self.0[8..].try_into().expect("gcs: key half"))
    }

    /// Hashes an element and reduces it into `[0, range)`.
    fn reduce(&self, range: u64, element: &[u8]) -> u64 {
        let h = siphash24::Hash::hash_to_u64_with_keys(self.k0(), self.k1(), element);
        ((h as u128 * range as u128) >> 64) as u64
    }
}

/// One Golomb-coded set.
///
/// Stores the raw coded bit stream plus the parameters needed to query
/// it.  The persisted ("encoded") form prefixes the element count as a
/// Bitcoin CompactSize.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Gcs {
    p: u8,
    m: u64,
    key: GcsKey,
    n: u64,
    compressed: Vec<u8>,
}

impl Gcs {
    /// Builds a filter over the given element set.
    ///
    /// The raw element set is deduplicated before hashing, so the
    /// committed count (and with it the reduction range queries must
    /// reproduce) is independent of how often callers repeat an
    /// element.  Distinct elements whose reductions collide stay in
    /// the stream as zero deltas.  Empty elements are rejected.
    pub fn build<I, T>(
        filter_type: FilterType,
        key: GcsKey,
        elements: I,
    ) -> Result<Self, GcsError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let p = filter_type.p();
        let m = filter_type.m() as u64;
        let mut elements: Vec<Vec<u8>> =
            elements.into_iter().map(|e| e.as_ref().to_vec()).collect();
        elements.sort_unstable();
        elements.dedup();

        if elements.iter().any(|e| e.is_empty()) {
            return Err(GcsError::EmptyElement);
        }

        let n = elements.len() as u64;
        if n >= MAX_ELEMENTS {
            return Err(GcsError::TooManyElements(n, MAX_ELEMENTS));
        }

        let range = n * m;
        let mut reduced: Vec<u64> = elements
            .iter()
            .map(|e| key.reduce(range, e.as_slice()))
            .collect();
        reduced.sort_unstable();

        let mut writer = BitWriter::new();
        let mut previous = 0u64;
        for value in &reduced {
            let delta = value - previous;
            writer.write_unary(delta >> p);
            writer.write_bits(delta, p);
            previous = *value;
        }

        Ok(Self {
            p,
            m,
            key,
            n,
            compressed: writer.into_bytes(),
        })
    }

    /// Parses the persisted form, a CompactSize element count followed
    /// by the coded bit stream.
    pub fn from_encoded(
        filter_type: FilterType,
        key: GcsKey,
        encoded: &[u8],
    ) -> Result<Self, GcsError> {
        let (count, consumed): (VarInt, usize) =
            deserialize_partial(encoded).map_err(|_| GcsError::BadPrefix)?;
        let n = count.0;
        if n >= MAX_ELEMENTS {
            return Err(GcsError::TooManyElements(n, MAX_ELEMENTS));
        }

        let out = Self {
            p: filter_type.p(),
            m: filter_type.m() as u64,
            key,
            n,
            compressed: encoded[consumed..].to_vec(),
        };

        // Walk the stream once so a truncated filter is rejected here
        // rather than surfacing during a later match query.
        out.decode()?;

        Ok(out)
    }

    /// Builds the filter a node would serve for a block, given the
    /// element set for the block under the filter type's rules.
    pub fn for_block<I, T>(
        filter_type: FilterType,
        block_hash: &Buf32,
        elements: I,
    ) -> Result<Self, GcsError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self::build(filter_type, GcsKey::from_block_hash(block_hash), elements)
    }

    pub fn element_count(&self) -> u64 {
        self.n
    }

    /// The raw coded bit stream without the count prefix.
    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }

    /// The persisted form: CompactSize count then the bit stream.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = serialize(&VarInt(self.n));
        out.extend_from_slice(&self.compressed);
        out
    }

    /// Double-SHA-256 of the encoded form.
    pub fn filter_hash(&self) -> Buf32 {
        hash::sha256d(&self.encoded())
    }

    /// The cfheader this filter produces when chained onto `previous`.
    pub fn header(&self, previous: &Buf32) -> Buf32 {
        hash::sha256d_pair(&self.filter_hash(), previous)
    }

    /// Decodes the full sorted value stream.
    pub fn decode(&self) -> Result<Vec<u64>, GcsError> {
        let mut reader = BitReader::new(&self.compressed);
        let mut out = Vec::with_capacity(self.n as usize);
        let mut previous = 0u64;
        for _ in 0..self.n {
            let quotient = reader.read_unary()?;
            let remainder = reader.read_bits(self.p)?;
            previous += (quotient << self.p) | remainder;
            out.push(previous);
        }
        Ok(out)
    }

    /// Tests whether any of the targets may be in the set.
    pub fn match_any<T: AsRef<[u8]>>(&self, targets: &[T]) -> Result<bool, GcsError> {
        Ok(!self.matched_indices(targets)?.is_empty())
    }

    /// Returns the indices of `targets` whose reductions appear in the
    /// set, by a linear merge against the sorted decoded stream.
    pub fn matched_indices<T: AsRef<[u8]>>(&self, targets: &[T]) -> Result<Vec<usize>, GcsError> {
        if self.n == 0 || targets.is_empty() {
            return Ok(Vec::new());
        }

        let range = self.n * self.m;
        let mut queries: Vec<(u64, usize)> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (self.key.reduce(range, t.as_ref()), i))
            .collect();
        queries.sort_unstable();

        let mut out = Vec::new();
        let mut reader = BitReader::new(&self.compressed);
        let mut value = 0u64;
        let mut remaining = self.n;
        let mut queries = queries.into_iter().peekable();

        'decode: while remaining > 0 {
            let quotient = reader.read_unary()?;
            let remainder = reader.read_bits(self.p)?;
            value += (quotient << self.p) | remainder;
            remaining -= 1;

            while let Some((query, index)) = queries.peek().copied() {
                match query.cmp(&value) {
                    std::cmp::Ordering::Equal => {
                        out.push(index);
                        queries.next();
                    }
                    std::cmp::Ordering::Less => {
                        queries.next();
                    }
                    std::cmp::Ordering::Greater => continue 'decode,
                }
            }

            break;
        }

        out.sort_unstable();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> GcsKey {
        GcsKey::from_block_hash(&Buf32::from([0x5a; 32]))
    }

    fn elements(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| format!("element-{i}").into_bytes())
            .collect()
    }

    #[test]
    fn test_empty_set_encoding() {
        let gcs = Gcs::build(FilterType::Basic, test_key(), Vec::<Vec<u8>>::new()).unwrap();
        assert_eq!(gcs.element_count(), 0);
        assert!(gcs.compressed().is_empty());
        assert_eq!(gcs.encoded(), vec![0x00]);
        assert!(!gcs.match_any(&elements(4)).unwrap());
    }

    #[test]
    fn test_round_trip_through_encoded_form() {
        let gcs = Gcs::build(FilterType::Basic, test_key(), elements(100)).unwrap();
        let restored = Gcs::from_encoded(FilterType::Basic, test_key(), &gcs.encoded()).unwrap();
        assert_eq!(restored, gcs);
        assert_eq!(restored.decode().unwrap(), gcs.decode().unwrap());
    }

    #[test]
    fn test_decoded_stream_matches_reductions() {
        let els = elements(50);
        let gcs = Gcs::build(FilterType::Basic, test_key(), &els).unwrap();

        let range = gcs.element_count() * FilterType::Basic.m() as u64;
        let mut expect: Vec<u64> = els.iter().map(|e| test_key().reduce(range, e)).collect();
        expect.sort_unstable();

        assert_eq!(gcs.decode().unwrap(), expect);
    }

    #[test]
    fn test_duplicate_elements_do_not_skew_the_range() {
        let els = elements(30);
        let mut doubled = els.clone();
        doubled.extend(els.clone());

        // Repeated elements collapse before hashing, so the committed
        // count (and the query-side reduction range derived from it)
        // matches a build over the distinct set.
        let gcs = Gcs::build(FilterType::Basic, test_key(), &doubled).unwrap();
        let distinct = Gcs::build(FilterType::Basic, test_key(), &els).unwrap();
        assert_eq!(gcs, distinct);
        assert_eq!(gcs.element_count(), els.len() as u64);

        // Every element still matches through the query path.
        assert_eq!(gcs.matched_indices(&els).unwrap().len(), els.len());
    }

    #[test]
    fn test_included_elements_always_match() {
        let els = elements(200);
        let gcs = Gcs::build(FilterType::Es, test_key(), &els).unwrap();

        for chunk in els.chunks(17) {
            assert!(gcs.match_any(chunk).unwrap());
        }

        let matched = gcs.matched_indices(&els).unwrap();
        assert_eq!(matched.len(), els.len());
    }

    #[test]
    fn test_absent_elements_rarely_match() {
        let els = elements(100);
        let gcs = Gcs::build(FilterType::Basic, test_key(), &els).unwrap();

        // With M = 784931 the chance of any of these 100 probes hitting
        // is about 1 in 80; treat a hit as failure since the set is
        // fixed.
        let absent: Vec<Vec<u8>> = (0..100)
            .map(|i| format!("absent-{i}").into_bytes())
            .collect();
        assert!(!gcs.match_any(&absent).unwrap());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let gcs = Gcs::build(FilterType::Basic, test_key(), elements(40)).unwrap();
        let mut encoded = gcs.encoded();
        encoded.truncate(encoded.len() - 4);
        assert!(Gcs::from_encoded(FilterType::Basic, test_key(), &encoded).is_err());
    }

    #[test]
    fn test_header_chain_law() {
        let gcs = Gcs::build(FilterType::Basic, test_key(), elements(10)).unwrap();
        let previous = Buf32::from([9; 32]);

        let mut cat = [0u8; 64];
        cat[..32].copy_from_slice(gcs.filter_hash().as_slice());
        cat[32..].copy_from_slice(previous.as_slice());
        assert_eq!(gcs.header(&previous), cinder_primitives::hash::sha256d(&cat));
    }

    #[test]
    fn test_empty_element_rejected() {
        let els: Vec<Vec<u8>> = vec![b"ok".to_vec(), Vec::new()];
        assert!(matches!(
            Gcs::build(FilterType::Basic, test_key(), &els),
            Err(GcsError::EmptyElement)
        ));
    }
}
