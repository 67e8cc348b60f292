use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Binary, Document};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

/// Completion watermark written into `ytag` once every channel of a batch
/// has been forwarded. Batches with a smaller (or absent) tag are
/// re-selected; raising this constant reprocesses the whole backlog.
pub const COMPLETION_WATERMARK: i32 = 2;

/// One stored capture-window document awaiting forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBatch {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub serial_number: String,
    pub data: Binary,
    /// Quarantine marker; any value at all excludes the batch from
    /// forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtag: Option<bson::Bson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytag: Option<i32>,
}

impl SourceBatch {
    pub fn payload(&self) -> &[u8] {
        &self.data.bytes
    }
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Forward-only scan of batches still needing forwarding for one device.
    async fn select_eligible(&self, serial: &str)
        -> Result<BoxStream<'static, Result<SourceBatch>>>;

    /// Idempotent point update raising the batch's completion tag. Failure
    /// is non-fatal; the batch is simply re-selected on a later pass.
    async fn mark_complete(&self, id: ObjectId, watermark: i32) -> Result<()>;
}

pub struct MongoFeed {
    collection: Collection<SourceBatch>,
}

impl MongoFeed {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("cannot open source store client")?;
        Ok(Self {
            collection: client.database(database).collection(collection),
        })
    }

    fn eligibility_filter(serial: &str) -> Document {
        doc! {
            "serial_number": serial,
            "xtag": { "$exists": false },
            "$or": [
                { "ytag": { "$lt": COMPLETION_WATERMARK } },
                { "ytag": { "$exists": false } },
            ],
        }
    }
}

#[async_trait]
impl SourceFeed for MongoFeed {
    async fn select_eligible(
        &self,
        serial: &str,
    ) -> Result<BoxStream<'static, Result<SourceBatch>>> {
        let cursor = self
            .collection
            .find(Self::eligibility_filter(serial))
            .await
            .context("eligible-batch query failed")?;
        Ok(cursor.map_err(anyhow::Error::from).boxed())
    }

    async fn mark_complete(&self, id: ObjectId, watermark: i32) -> Result<()> {
        self.collection
            .update_one(doc! { "_id": id }, doc! { "$set": { "ytag": watermark } })
            .await
            .context("completion tag update failed")?;
        Ok(())
    }
}
