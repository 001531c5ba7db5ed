use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type CertDigest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateEntry {
    pub id: u64,
    pub digest: CertDigest,
    /// True only the first time this digest is observed.
    pub fresh: bool,
}

/// Content-addressed certificate identities, first-seen order starting at 1.
/// Lives for the whole process and only grows.
#[derive(Debug)]
pub struct CertificateCache {
    ids: HashMap<CertDigest, u64>,
    next_id: u64,
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateCache {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn digest(der: &[u8]) -> CertDigest {
        Sha256::digest(der).into()
    }

    /// Starts assigning identities for one session's chain. Nothing is
    /// recorded until the staged digests are passed to [`Self::commit`].
    pub fn stage(&self) -> StagedCertificates<'_> {
        StagedCertificates {
            cache: self,
            added: Vec::new(),
        }
    }

    /// Makes staged identities permanent, in staging order.
    pub fn commit(&mut self, digests: &[CertDigest]) {
        for digest in digests {
            if !self.ids.contains_key(digest) {
                self.ids.insert(*digest, self.next_id);
                self.next_id += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Identities for one chain, on top of what the cache already knows.
pub struct StagedCertificates<'a> {
    cache: &'a CertificateCache,
    added: Vec<CertDigest>,
}

impl StagedCertificates<'_> {
    pub fn observe(&mut self, der: &[u8]) -> CertificateEntry {
        let digest = CertificateCache::digest(der);
        if let Some(&id) = self.cache.ids.get(&digest) {
            return CertificateEntry {
                id,
                digest,
                fresh: false,
            };
        }
        let base = self.cache.next_id;
        if let Some(pos) = self.added.iter().position(|d| *d == digest) {
            return CertificateEntry {
                id: base + pos as u64,
                digest,
                fresh: false,
            };
        }
        self.added.push(digest);
        CertificateEntry {
            id: base + self.added.len() as u64 - 1,
            digest,
            fresh: true,
        }
    }

    /// Digests first seen in this batch, for [`CertificateCache::commit`].
    pub fn into_added(self) -> Vec<CertDigest> {
        self.added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_share_one_identity() {
        let mut cache = CertificateCache::new();
        let mut staged = cache.stage();
        let a = staged.observe(b"cert-a");
        let b = staged.observe(b"cert-b");
        let again = staged.observe(b"cert-a");
        let added = staged.into_added();

        assert!(a.fresh && b.fresh);
        assert!(!again.fresh);
        assert_eq!((a.id, b.id, again.id), (1, 2, 1));
        assert_eq!(again.digest, a.digest);
        cache.commit(&added);
        assert_eq!(cache.len(), 2);

        let mut staged = cache.stage();
        let known = staged.observe(b"cert-b");
        let new = staged.observe(b"cert-c");
        assert_eq!((known.id, known.fresh), (2, false));
        assert_eq!((new.id, new.fresh), (3, true));
    }

    #[test]
    fn uncommitted_stage_leaves_cache_untouched() {
        let mut cache = CertificateCache::new();
        cache.stage().observe(b"cert-a");
        assert!(cache.is_empty());

        let mut staged = cache.stage();
        let entry = staged.observe(b"cert-a");
        assert_eq!((entry.id, entry.fresh), (1, true));
        let added = staged.into_added();
        cache.commit(&added);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn digest_is_sha256() {
        assert_eq!(
            hex::encode(CertificateCache::digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
