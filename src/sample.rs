//! Ambient — document sampling sources feeding Module B (spec §4.B notes
//! that sampling is an injected sequence the inference engine itself never
//! produces). `VecDocumentSource` is the test double this crate's own
//! inference tests use; `MongoSampleSource` (feature `mongo-sample`, on by
//! default) is a real network sampler grounded on the teacher's
//! `engine/drivers/mongodb.rs::describe_table` cursor loop, generalized
//! across the four `ScanMethod` strategies the connection URL exposes.

use mongodb::bson::Document;

use crate::error::EngineResult;

/// A finite, already-materialized sequence of sampled documents. Used by
/// tests and by any caller that has already fetched its sample out of band.
pub struct VecDocumentSource {
    documents: std::vec::IntoIter<Document>,
}

impl VecDocumentSource {
    pub fn new(documents: Vec<Document>) -> Self {
        VecDocumentSource { documents: documents.into_iter() }
    }
}

impl Iterator for VecDocumentSource {
    type Item = EngineResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.documents.next().map(Ok)
    }
}

#[cfg(feature = "mongo-sample")]
mod mongo {
    use futures::stream::TryStreamExt;
    use mongodb::bson::{doc, Document};
    use mongodb::options::FindOptions;
    use mongodb::Collection;

    use crate::connection_url::ScanMethod;
    use crate::error::{EngineError, EngineResult};

    /// Pulls a finite sample from `collection` according to `method`,
    /// returning it fully materialized (the inference engine only needs an
    /// `Iterator`, and a cursor borrows the collection for longer than this
    /// module wants to thread through the trait boundary).
    pub async fn sample(collection: &Collection<Document>, method: ScanMethod, limit: Option<u64>) -> EngineResult<Vec<Document>> {
        let limit = limit.unwrap_or(100) as i64;
        let cursor = match method {
            ScanMethod::Random => {
                let pipeline = vec![doc! { "$sample": { "size": limit } }];
                let mut cursor = collection
                    .aggregate(pipeline)
                    .await
                    .map_err(|e| EngineError::connection_error(e.to_string()))?;
                let mut docs = Vec::new();
                while let Some(doc) = cursor.try_next().await.map_err(|e| EngineError::connection_error(e.to_string()))? {
                    docs.push(doc);
                }
                return Ok(docs);
            }
            ScanMethod::IdForward => {
                let options = FindOptions::builder().sort(doc! { "_id": 1 }).limit(limit).build();
                collection
                    .find(doc! {})
                    .with_options(options)
                    .await
                    .map_err(|e| EngineError::connection_error(e.to_string()))?
            }
            ScanMethod::IdReverse => {
                let options = FindOptions::builder().sort(doc! { "_id": -1 }).limit(limit).build();
                collection
                    .find(doc! {})
                    .with_options(options)
                    .await
                    .map_err(|e| EngineError::connection_error(e.to_string()))?
            }
            ScanMethod::All => {
                let options = FindOptions::builder().limit(limit).build();
                collection
                    .find(doc! {})
                    .with_options(options)
                    .await
                    .map_err(|e| EngineError::connection_error(e.to_string()))?
            }
        };
        cursor.try_collect().await.map_err(|e| EngineError::connection_error(e.to_string()))
    }
}

#[cfg(feature = "mongo-sample")]
pub use mongo::sample as mongo_sample;

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn vec_source_yields_documents_in_order() {
        let mut source = VecDocumentSource::new(vec![doc! {"a": 1}, doc! {"a": 2}]);
        assert_eq!(source.next().unwrap().unwrap().get_i32("a").unwrap(), 1);
        assert_eq!(source.next().unwrap().unwrap().get_i32("a").unwrap(), 2);
        assert!(source.next().is_none());
    }
}
