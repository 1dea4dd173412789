//! Subchain scanning-state store.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rockbound::{SchemaBatch, DB};
use tracing::*;

use cinder_db::traits::SubchainStore;
use cinder_db::types::{ElementMap, Pattern};
use cinder_db::{DbError, DbResult};

use crate::{backend_err, codec_err};
use cinder_primitives::prelude::*;

use crate::cache::TableCache;
use crate::schemas::*;

/// Subchain tables plus their write-through caches.
pub struct SubchainDb {
    db: Arc<DB>,
    chain: Chain,
    /// Serializes writers; readers go through the caches.
    write_lock: Mutex<()>,
    ids: TableCache<SubchainIndex, SubchainIdRecord>,
    last_indexed: TableCache<SubchainIndex, ChildIndex>,
    last_scanned: TableCache<SubchainIndex, BlockPosition>,
    pattern_index: TableCache<SubchainIndex, BTreeSet<PatternId>>,
    patterns: TableCache<PatternId, BTreeSet<PatternEntry>>,
    match_index: TableCache<Buf32, BTreeSet<PatternId>>,
}

impl SubchainDb {
    pub fn new(db: Arc<DB>, chain: Chain) -> Self {
        Self {
            db,
            chain,
            write_lock: Mutex::new(()),
            ids: TableCache::new(),
            last_indexed: TableCache::new(),
            last_scanned: TableCache::new(),
            pattern_index: TableCache::new(),
            patterns: TableCache::new(),
            match_index: TableCache::new(),
        }
    }

    /// Drops every cached row, forcing reloads from disk.
    pub fn flush_caches(&self) {
        self.ids.clear();
        self.last_indexed.clear();
        self.last_scanned.clear();
        self.pattern_index.clear();
        self.patterns.clear();
        self.match_index.clear();
    }

    fn pattern_ids(&self, subchain: &SubchainIndex) -> DbResult<BTreeSet<PatternId>> {
        Ok(self
            .pattern_index
            .get_or_load(subchain, || {
                self.db
                    .get::<PatternIndexSchema>(subchain)
                    .map_err(backend_err)
            })?
            .unwrap_or_default())
    }

    fn load_patterns(&self, ids: &BTreeSet<PatternId>) -> DbResult<Vec<Pattern>> {
        let mut out = Vec::new();
        for id in ids {
            let entries = self
                .patterns
                .get_or_load(id, || self.db.get::<PatternsSchema>(id).map_err(backend_err))?
                .unwrap_or_default();
            for entry in entries {
                out.push(Pattern {
                    id: *id,
                    index: entry.index,
                    element: entry.element,
                });
            }
        }
        Ok(out)
    }
}

impl SubchainStore for SubchainDb {
    fn get_or_create_subchain(
        &self,
        subaccount: &SubaccountId,
        kind: SubchainKind,
        filter_type: FilterType,
    ) -> DbResult<SubchainIndex> {
        let index = SubchainIndex::derive(subaccount, kind, filter_type, SubchainIndex::VERSION);

        let existing = self.ids.get_or_load(&index, || {
            self.db.get::<SubchainIdSchema>(&index).map_err(backend_err)
        })?;
        if existing.is_some() {
            return Ok(index);
        }

        let _guard = self.write_lock.lock();
        let record = SubchainIdRecord {
            subaccount: *subaccount,
            kind,
            filter_type,
            version: SubchainIndex::VERSION,
        };
        self.db
            .put::<SubchainIdSchema>(&index, &record)
            .map_err(backend_err)?;
        self.ids.put(index, record);
        debug!(chain = %self.chain, %subaccount, ?kind, "allocated subchain index");

        Ok(index)
    }

    fn add_elements(&self, subchain: &SubchainIndex, elements: &ElementMap) -> DbResult<()> {
        if elements.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut batch = SchemaBatch::new();

        let mut index = self.pattern_ids(subchain)?;
        let mut highest = self
            .last_indexed
            .get_or_load(subchain, || {
                self.db
                    .get::<LastIndexedSchema>(subchain)
                    .map_err(backend_err)
            })?
            .unwrap_or(0);

        let mut touched = Vec::new();
        for (child, items) in elements {
            let id = PatternId::derive(subchain, *child);
            let mut entries = self
                .patterns
                .get_or_load(&id, || {
                    self.db.get::<PatternsSchema>(&id).map_err(backend_err)
                })?
                .unwrap_or_default();

            for element in items {
                entries.insert(PatternEntry {
                    index: *child,
                    element: element.clone(),
                });
            }

            batch
                .put::<PatternsSchema>(&id, &entries)
                .map_err(codec_err)?;
            touched.push((id, entries));
            index.insert(id);
            highest = highest.max(*child);
        }

        batch
            .put::<PatternIndexSchema>(subchain, &index)
            .map_err(codec_err)?;
        batch
            .put::<LastIndexedSchema>(subchain, &highest)
            .map_err(codec_err)?;

        if let Err(e) = self.db.write_schemas(batch) {
            self.flush_caches();
            return Err(backend_err(e));
        }

        for (id, entries) in touched {
            self.patterns.put(id, entries);
        }
        self.pattern_index.put(*subchain, index);
        self.last_indexed.put(*subchain, highest);

        Ok(())
    }

    fn patterns(&self, subchain: &SubchainIndex) -> DbResult<Vec<Pattern>> {
        let ids = self.pattern_ids(subchain)?;
        self.load_patterns(&ids)
    }

    fn untested_patterns(&self, subchain: &SubchainIndex, block: &Buf32) -> DbResult<Vec<Pattern>> {
        let mut ids = self.pattern_ids(subchain)?;
        let tested = self
            .match_index
            .get_or_load(block, || {
                self.db.get::<MatchIndexSchema>(block).map_err(backend_err)
            })?
            .unwrap_or_default();
        for id in &tested {
            ids.remove(id);
        }
        self.load_patterns(&ids)
    }

    fn add_tested(
        &self,
        _subchain: &SubchainIndex,
        block: &Buf32,
        patterns: &BTreeSet<PatternId>,
    ) -> DbResult<()> {
        if patterns.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut tested = self
            .match_index
            .get_or_load(block, || {
                self.db.get::<MatchIndexSchema>(block).map_err(backend_err)
            })?
            .unwrap_or_default();
        tested.extend(patterns.iter().copied());

        if let Err(e) = self.db.put::<MatchIndexSchema>(block, &tested) {
            self.flush_caches();
            return Err(backend_err(e));
        }
        self.match_index.put(*block, tested);

        Ok(())
    }

    fn last_indexed(&self, subchain: &SubchainIndex) -> DbResult<Option<ChildIndex>> {
        self.last_indexed.get_or_load(subchain, || {
            self.db
                .get::<LastIndexedSchema>(subchain)
                .map_err(backend_err)
        })
    }

    fn last_scanned(&self, subchain: &SubchainIndex) -> DbResult<BlockPosition> {
        Ok(self
            .last_scanned
            .get_or_load(subchain, || {
                self.db
                    .get::<LastScannedSchema>(subchain)
                    .map_err(backend_err)
            })?
            .unwrap_or_else(BlockPosition::blank))
    }

    fn set_last_scanned(&self, subchain: &SubchainIndex, position: BlockPosition) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        if let Err(e) = self.db.put::<LastScannedSchema>(subchain, &position) {
            self.flush_caches();
            return Err(backend_err(e));
        }
        self.last_scanned.put(*subchain, position);
        Ok(())
    }

    fn subchain_reorg(
        &self,
        subchain: &SubchainIndex,
        last_good: Height,
        resolve: &dyn Fn(Height) -> Option<BlockPosition>,
    ) -> DbResult<bool> {
        let current = self.last_scanned(subchain)?;

        let target = if current.height() < last_good {
            trace!(
                %current,
                %last_good,
                "no action required, scan progress is below the reorg parent"
            );
            return Ok(false);
        } else if current.height() > last_good {
            last_good
        } else {
            (last_good - 1).max(0)
        };

        let position = resolve(target)
            .ok_or_else(|| DbError::Other(format!("no best-chain position at {target}")))?;
        trace!(%position, "resetting last scanned");
        self.set_last_scanned(subchain, position)?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_db;

    fn store() -> SubchainDb {
        SubchainDb::new(temp_db(), Chain::UnitTest)
    }

    fn subchain(db: &SubchainDb) -> SubchainIndex {
        db.get_or_create_subchain(
            &Buf32::from([1; 32]),
            SubchainKind::External,
            FilterType::Basic,
        )
        .unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = store();
        let a = subchain(&db);
        let b = subchain(&db);
        assert_eq!(a, b);
    }

    #[test]
    fn test_add_elements_advances_last_indexed() {
        let db = store();
        let sc = subchain(&db);
        assert_eq!(db.last_indexed(&sc).unwrap(), None);

        let mut elements = ElementMap::new();
        elements.insert(0, vec![b"pat-0".to_vec()]);
        elements.insert(3, vec![b"pat-3a".to_vec(), b"pat-3b".to_vec()]);
        db.add_elements(&sc, &elements).unwrap();

        assert_eq!(db.last_indexed(&sc).unwrap(), Some(3));
        let patterns = db.patterns(&sc).unwrap();
        assert_eq!(patterns.len(), 3);
        assert!(patterns
            .iter()
            .any(|p| p.index == 3 && p.element == b"pat-3b"));

        // Survives a cache flush.
        db.flush_caches();
        assert_eq!(db.patterns(&sc).unwrap().len(), 3);
    }

    #[test]
    fn test_untested_patterns_excludes_tested() {
        let db = store();
        let sc = subchain(&db);
        let mut elements = ElementMap::new();
        elements.insert(0, vec![b"a".to_vec()]);
        elements.insert(1, vec![b"b".to_vec()]);
        db.add_elements(&sc, &elements).unwrap();

        let block = Buf32::from([7; 32]);
        assert_eq!(db.untested_patterns(&sc, &block).unwrap().len(), 2);

        let tested: BTreeSet<_> = [PatternId::derive(&sc, 0)].into();
        db.add_tested(&sc, &block, &tested).unwrap();

        let untested = db.untested_patterns(&sc, &block).unwrap();
        assert_eq!(untested.len(), 1);
        assert_eq!(untested[0].index, 1);
    }

    #[test]
    fn test_last_scanned_and_reorg() {
        let db = store();
        let sc = subchain(&db);
        assert!(db.last_scanned(&sc).unwrap().is_blank());

        let resolve = |height: Height| Some(BlockPosition::new(height, Buf32::from([9; 32])));

        let pos = BlockPosition::new(100, Buf32::from([1; 32]));
        db.set_last_scanned(&sc, pos).unwrap();
        assert_eq!(db.last_scanned(&sc).unwrap(), pos);

        // Progress below the reorg parent: untouched.
        assert!(!db.subchain_reorg(&sc, 150, &resolve).unwrap());
        assert_eq!(db.last_scanned(&sc).unwrap(), pos);

        // Progress above the reorg parent: rewound to the parent.
        assert!(db.subchain_reorg(&sc, 90, &resolve).unwrap());
        assert_eq!(db.last_scanned(&sc).unwrap().height(), 90);

        // Progress exactly at the parent: rewound one below it.
        assert!(db.subchain_reorg(&sc, 90, &resolve).unwrap());
        assert_eq!(db.last_scanned(&sc).unwrap().height(), 89);
    }
}
