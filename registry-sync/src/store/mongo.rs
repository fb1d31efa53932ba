use super::{
    ChangeEvent, ChangeOperation, ChangeStream, DirectoryStore, ServiceFilter, StoreError,
};
use crate::types::{ServiceDocument, ServiceRecord, StoreKey};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::change_stream::event::OperationType;
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection};

/// Directory backed by a MongoDB collection (replica set required for
/// change streams).
pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connects and pings the primary so an unreachable store is reported
    /// here rather than on first use.
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).await?;

        tracing::info!(database, collection, "connected to directory store");
        Ok(MongoStore {
            collection: db.collection::<Document>(collection),
        })
    }
}

fn key_filter(key: &StoreKey) -> Document {
    doc! { "_id": key.to_string() }
}

fn query_filter(filter: &ServiceFilter) -> Document {
    let mut query = Document::new();
    if let Some(pattern) = &filter.name_contains {
        query.insert("Name", doc! { "$regex": pattern.as_str() });
    }
    if let Some(cluster) = &filter.owning_cluster {
        query.insert("Meta.NextensioCluster", cluster.as_str());
    }
    query
}

fn operation(op: &OperationType) -> ChangeOperation {
    match op {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update => ChangeOperation::Update,
        OperationType::Replace => ChangeOperation::Replace,
        OperationType::Delete => ChangeOperation::Delete,
        OperationType::Drop => ChangeOperation::Admin("drop".into()),
        OperationType::DropDatabase => ChangeOperation::Admin("dropDatabase".into()),
        OperationType::Invalidate => ChangeOperation::Admin("invalidate".into()),
        OperationType::Rename => ChangeOperation::Admin("rename".into()),
        OperationType::Other(other) => ChangeOperation::Admin(other.clone()),
        other => ChangeOperation::Admin(format!("{other:?}")),
    }
}

fn to_change_event(
    op: &OperationType,
    document_key: Option<&Document>,
    full_document: Option<Document>,
) -> ChangeEvent {
    ChangeEvent {
        operation: operation(op),
        key: document_key
            .and_then(|k| k.get_str("_id").ok())
            .map(String::from),
        document: full_document.map(|d| Bson::Document(d).into_relaxed_extjson()),
    }
}

#[async_trait]
impl DirectoryStore for MongoStore {
    async fn upsert(&self, key: &StoreKey, record: &ServiceRecord) -> Result<(), StoreError> {
        let document = bson::to_document(&ServiceDocument::new(key, record))?;
        self.collection
            .replace_one(key_filter(key), document)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.collection.delete_one(key_filter(key)).await?;
        Ok(())
    }

    async fn find_one(&self, key: &StoreKey) -> Result<Option<ServiceRecord>, StoreError> {
        match self.collection.find_one(key_filter(key)).await? {
            Some(document) => {
                let decoded: ServiceDocument = bson::from_document(document)?;
                Ok(Some(decoded.into()))
            }
            None => Ok(None),
        }
    }

    async fn find_all(&self, filter: &ServiceFilter) -> Result<Vec<ServiceRecord>, StoreError> {
        let documents: Vec<Document> = self
            .collection
            .find(query_filter(filter))
            .await?
            .try_collect()
            .await?;

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            match bson::from_document::<ServiceDocument>(document) {
                Ok(decoded) => records.push(decoded.into()),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable directory record"),
            }
        }
        Ok(records)
    }

    async fn watch_changes(&self) -> Result<ChangeStream, StoreError> {
        let stream = self
            .collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .await?;

        Ok(stream
            .map(|item| {
                item.map(|event| {
                    to_change_event(
                        &event.operation_type,
                        event.document_key.as_ref(),
                        event.full_document,
                    )
                })
                .map_err(StoreError::from)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_filter() {
        let filter = ServiceFilter::default()
            .name_contains("tenantA")
            .owning_cluster("clusterX");
        assert_eq!(
            query_filter(&filter),
            doc! {
                "Name": { "$regex": "tenantA" },
                "Meta.NextensioCluster": "clusterX",
            }
        );
        assert_eq!(query_filter(&ServiceFilter::default()), doc! {});
    }

    #[test]
    fn test_change_event_conversion() {
        let key = doc! { "_id": "clusterY?svc2" };
        let full = doc! {
            "_id": "clusterY?svc2",
            "ID": "svc2",
            "Name": "app.tenantA",
            "Address": "10.0.0.2",
            "Meta": { "NextensioCluster": "clusterY", "NextensioPod": "pod-2" },
        };

        let event = to_change_event(&OperationType::Insert, Some(&key), Some(full));
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert_eq!(event.key.as_deref(), Some("clusterY?svc2"));
        let decoded: ServiceDocument = serde_json::from_value(event.document.unwrap()).unwrap();
        assert_eq!(decoded.id, "svc2");

        let event = to_change_event(&OperationType::Delete, Some(&key), None);
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert!(event.document.is_none());

        let event = to_change_event(&OperationType::DropDatabase, None, None);
        assert_eq!(event.operation, ChangeOperation::Admin("dropDatabase".into()));
        assert!(event.key.is_none());
    }
}
