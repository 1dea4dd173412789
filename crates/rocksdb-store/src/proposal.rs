//! Pending spend proposal store.

use std::collections::BTreeSet;
use std::sync::Arc;

use rockbound::{SchemaBatch, DB};

use cinder_db::traits::ProposalStore;
use cinder_db::types::ProposalRecord;
use cinder_db::DbResult;
use cinder_primitives::buf::Buf32;

use crate::schemas::*;
use crate::{backend_err, codec_err};

pub struct ProposalDb {
    db: Arc<DB>,
}

impl ProposalDb {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl ProposalStore for ProposalDb {
    fn add_proposal(&self, record: &ProposalRecord) -> DbResult<()> {
        self.db
            .put::<ProposalSchema>(&record.id, record)
            .map_err(backend_err)
    }

    fn load_proposal(&self, id: &Buf32) -> DbResult<Option<ProposalRecord>> {
        self.db.get::<ProposalSchema>(id).map_err(backend_err)
    }

    fn load_proposals(&self) -> DbResult<Vec<ProposalRecord>> {
        let iter = self.db.iter::<ProposalSchema>().map_err(backend_err)?.into_iter();
        let mut out = Vec::new();
        for item in iter {
            let (_, record) = item.map_err(backend_err)?.into_tuple();
            out.push(record);
        }
        Ok(out)
    }

    fn completed_proposals(&self) -> DbResult<BTreeSet<Buf32>> {
        let iter = self
            .db
            .iter::<CompletedProposalSchema>()
            .map_err(backend_err)?
            .into_iter();
        let mut out = BTreeSet::new();
        for item in iter {
            let (id, ()) = item.map_err(backend_err)?.into_tuple();
            out.insert(id);
        }
        Ok(out)
    }

    fn forget_proposals(&self, ids: &BTreeSet<Buf32>) -> DbResult<()> {
        let mut batch = SchemaBatch::new();
        for id in ids {
            batch.delete::<ProposalSchema>(id).map_err(codec_err)?;
            batch
                .delete::<CompletedProposalSchema>(id)
                .map_err(codec_err)?;
        }
        self.db.write_schemas(batch).map_err(backend_err)
    }

    fn confirm_proposal(&self, id: &Buf32) -> DbResult<()> {
        self.db
            .put::<CompletedProposalSchema>(id, &())
            .map_err(backend_err)
    }
}
