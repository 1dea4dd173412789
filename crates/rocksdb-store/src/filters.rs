//! Persisted cfheader/cfilter chain state.

use std::sync::Arc;

use rockbound::{SchemaBatch, DB};

use cinder_db::traits::FilterStore;
use cinder_db::DbResult;
use cinder_gcs::{Gcs, GcsKey};
use cinder_primitives::prelude::*;

use crate::schemas::*;
use crate::{backend_err, codec_err};

pub struct FilterDb {
    db: Arc<DB>,
}

impl FilterDb {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl FilterStore for FilterDb {
    fn store_headers(&self, filter_type: FilterType, headers: &[(Buf32, Buf32)]) -> DbResult<()> {
        let mut batch = SchemaBatch::new();
        for (block, header) in headers {
            batch
                .put::<FilterHeaderSchema>(&(filter_type, *block), header)
                .map_err(codec_err)?;
        }
        self.db.write_schemas(batch).map_err(backend_err)
    }

    fn load_header(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Buf32>> {
        self.db
            .get::<FilterHeaderSchema>(&(filter_type, *block))
            .map_err(backend_err)
    }

    fn store_filters(&self, filter_type: FilterType, filters: &[(Buf32, Gcs)]) -> DbResult<()> {
        let mut batch = SchemaBatch::new();
        for (block, filter) in filters {
            batch
                .put::<FilterSchema>(&(filter_type, *block), &filter.encoded())
                .map_err(codec_err)?;
        }
        self.db.write_schemas(batch).map_err(backend_err)
    }

    fn load_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Gcs>> {
        let Some(encoded) = self
            .db
            .get::<FilterSchema>(&(filter_type, *block))
            .map_err(backend_err)?
        else {
            return Ok(None);
        };

        let key = GcsKey::from_block_hash(block);
        let gcs = Gcs::from_encoded(filter_type, key, &encoded)
            .map_err(|e| cinder_db::DbError::Codec(e.to_string()))?;
        Ok(Some(gcs))
    }

    fn have_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<bool> {
        Ok(self
            .db
            .get::<FilterSchema>(&(filter_type, *block))
            .map_err(backend_err)?
            .is_some())
    }

    fn header_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>> {
        self.db
            .get::<HeaderTipSchema>(&filter_type)
            .map_err(backend_err)
    }

    fn set_header_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()> {
        self.db
            .put::<HeaderTipSchema>(&filter_type, position)
            .map_err(backend_err)
    }

    fn filter_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>> {
        self.db
            .get::<FilterTipSchema>(&filter_type)
            .map_err(backend_err)
    }

    fn set_filter_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()> {
        self.db
            .put::<FilterTipSchema>(&filter_type, position)
            .map_err(backend_err)
    }
}
