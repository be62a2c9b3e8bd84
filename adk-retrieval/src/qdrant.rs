//! Qdrant vector store backend.
//!
//! Provides [`QdrantVectorStore`] which implements [`VectorStore`] using
//! the [qdrant-client](https://docs.rs/qdrant-client) crate over gRPC.
//!
//! # Example
//!
//! ```rust,ignore
//! use adk_retrieval::qdrant::QdrantVectorStore;
//!
//! let store = QdrantVectorStore::new("http://localhost:6334")?.with_dimensions(384);
//! store.create_collection("docs", false, true).await?;
//! store.insert_docs(&documents, None, false).await?;
//! let results = store.retrieve_docs(&[query], None).await?;
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance as QdrantDistance, Filter,
    GetPointsBuilder, PointId, PointStruct, PointsIdsList, RetrievedPoint, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::document::{
    Document, ItemId, Metadata, MetadataValue, Query, QueryMatch, QueryResults, TITLE_KEY,
};
use crate::error::{RagError, Result};
use crate::vectorstore::{
    Collection, Distance, VectorStore, VectorStoreOptions, batches, check_insert_schema,
    check_queries,
};

const BACKEND: &str = "qdrant";

/// Default gRPC endpoint of a local Qdrant instance.
pub const DEFAULT_URL: &str = "http://localhost:6334";

const SCROLL_PAGE: u32 = 256;

const ITEM_ID_FIELD: &str = "item_id";
const CONTENT_FIELD: &str = "content";
const METADATA_FIELD: &str = "metadata";
const MODEL_FIELD: &str = "embedding_model";

#[derive(Debug, Default)]
struct LocalState {
    descriptors: HashMap<String, Collection>,
    active: Option<String>,
}

/// A [`VectorStore`] backed by [Qdrant](https://qdrant.tech/).
///
/// Wraps a [`qdrant_client::Qdrant`] client and maps collections to Qdrant
/// collections. Document fields are stored as Qdrant payload; string ids that
/// are not UUIDs are mapped to name-based UUIDs and the original id is kept
/// in the payload. Qdrant reports similarities, which are converted to
/// distances with [`Distance::from_similarity`]. Stored vectors are not
/// returned by reads.
pub struct QdrantVectorStore {
    client: Qdrant,
    options: VectorStoreOptions,
    state: RwLock<LocalState>,
}

impl QdrantVectorStore {
    /// Create a new Qdrant vector store connecting to the given URL.
    pub fn new(url: &str) -> Result<Self> {
        Self::from_options(&VectorStoreOptions {
            url: Some(url.to_string()),
            ..VectorStoreOptions::default()
        })
    }

    /// Create a store from generic backend options, defaulting to
    /// [`DEFAULT_URL`].
    pub fn from_options(options: &VectorStoreOptions) -> Result<Self> {
        let url = options.url.as_deref().unwrap_or(DEFAULT_URL);
        let client = Qdrant::from_url(url).build().map_err(Self::map_err)?;
        Ok(Self::from_client(client, options.clone()))
    }

    /// Create a new Qdrant vector store from an existing client.
    pub fn from_client(client: Qdrant, options: VectorStoreOptions) -> Self {
        Self { client, options, state: RwLock::default() }
    }

    /// Set the vector size used when creating collections.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.options.dimensions = Some(dimensions);
        self
    }

    fn map_err(e: qdrant_client::QdrantError) -> RagError {
        RagError::external(BACKEND, e.to_string())
    }

    fn embedding_model(&self) -> Option<String> {
        self.options.embedding_function.as_ref().and_then(|f| f.model_name().map(str::to_string))
    }

    fn vector_size(&self) -> Result<u64> {
        self.options
            .dimensions
            .or_else(|| self.options.embedding_function.as_ref().and_then(|f| f.dimensions()))
            .map(|d| d as u64)
            .ok_or_else(|| {
                RagError::Configuration(
                    "qdrant collections need a vector size; set dimensions or an embedding \
                     function that declares them"
                        .into(),
                )
            })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let collections = self.client.list_collections().await.map_err(Self::map_err)?;
        Ok(collections.collections.iter().any(|c| c.name == name))
    }

    async fn resolve_name(&self, name: Option<&str>) -> Result<String> {
        match name {
            Some(name) => Ok(name.to_string()),
            None => self
                .state
                .read()
                .await
                .active
                .clone()
                .ok_or_else(|| RagError::NotFound("no collection is specified or active".into())),
        }
    }

    async fn require(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            Ok(())
        } else {
            Err(RagError::NotFound(format!("collection '{name}' does not exist")))
        }
    }

    async fn descriptor(&self, name: &str) -> Collection {
        let mut state = self.state.write().await;
        state
            .descriptors
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(name, self.options.distance, self.embedding_model()))
            .clone()
    }

    async fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let function = self.options.embedding_function.as_ref().ok_or_else(|| {
            RagError::Configuration(
                "no embeddings were provided and the vector store has no embedding function"
                    .into(),
            )
        })?;
        let vectors = function.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::external(
                BACKEND,
                format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }

    async fn fetch_points(&self, name: &str, ids: &[ItemId]) -> Result<Vec<RetrievedPoint>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let point_ids: Vec<PointId> = ids.iter().map(point_id).collect();
        let response = self
            .client
            .get_points(GetPointsBuilder::new(name, point_ids).with_payload(true))
            .await
            .map_err(Self::map_err)?;
        Ok(response.result)
    }
}

/// What `create_collection` does with the server.
#[derive(Debug, PartialEq, Eq)]
enum CreatePlan {
    Reuse,
    /// Create with `size`, dropping the existing collection first if `replace`.
    Create { size: u64, replace: bool },
}

/// Decide the create action. The vector size is checked before anything is
/// dropped, so a failed overwrite leaves the existing collection intact.
fn plan_create(
    name: &str,
    exists: bool,
    overwrite: bool,
    get_or_create: bool,
    vector_size: impl FnOnce() -> Result<u64>,
) -> Result<CreatePlan> {
    if exists && !overwrite {
        if get_or_create {
            return Ok(CreatePlan::Reuse);
        }
        return Err(RagError::AlreadyExists(format!("collection '{name}' already exists")));
    }
    Ok(CreatePlan::Create { size: vector_size()?, replace: exists })
}

fn qdrant_distance(distance: Distance) -> QdrantDistance {
    match distance {
        Distance::InnerProduct => QdrantDistance::Dot,
        Distance::Cosine => QdrantDistance::Cosine,
        Distance::L2 => QdrantDistance::Euclid,
    }
}

/// Qdrant accepts unsigned integers and UUIDs as point ids.
fn point_id(id: &ItemId) -> PointId {
    match id {
        ItemId::Int(n) => PointId::from(*n),
        ItemId::Str(s) => match Uuid::parse_str(s) {
            Ok(uuid) => PointId::from(uuid.to_string()),
            Err(_) => PointId::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, s.as_bytes()).to_string()),
        },
    }
}

fn metadata_value(value: &QdrantValue) -> MetadataValue {
    match &value.kind {
        Some(Kind::BoolValue(b)) => MetadataValue::Bool(*b),
        Some(Kind::IntegerValue(i)) => MetadataValue::Int(*i),
        Some(Kind::DoubleValue(f)) => MetadataValue::Float(*f),
        Some(Kind::StringValue(s)) => MetadataValue::Str(s.clone()),
        _ => MetadataValue::Null,
    }
}

fn extract_string(payload: &HashMap<String, QdrantValue>, key: &str) -> String {
    match payload.get(key).map(|v| &v.kind) {
        Some(Some(Kind::StringValue(s))) => s.clone(),
        _ => String::new(),
    }
}

fn payload_for(doc: &Document) -> Result<Payload> {
    let mut map = serde_json::Map::new();
    map.insert(ITEM_ID_FIELD.into(), serde_json::to_value(&doc.id)?);
    map.insert(TITLE_KEY.into(), serde_json::Value::String(doc.title.clone()));
    map.insert(CONTENT_FIELD.into(), serde_json::Value::String(doc.content.clone()));
    if let Some(metadata) = &doc.metadata {
        map.insert(METADATA_FIELD.into(), serde_json::to_value(metadata)?);
    }
    if let Some(model) = &doc.embedding_model {
        map.insert(MODEL_FIELD.into(), serde_json::Value::String(model.clone()));
    }
    Payload::try_from(serde_json::Value::Object(map))
        .map_err(|e| RagError::external(BACKEND, format!("invalid payload: {e}")))
}

/// Rebuild a document from a point payload. Vectors are not fetched.
fn document_from_payload(id: Option<&PointId>, payload: &HashMap<String, QdrantValue>) -> Document {
    let item_id = match payload.get(ITEM_ID_FIELD).map(|v| &v.kind) {
        Some(Some(Kind::IntegerValue(n))) => ItemId::Int(*n as u64),
        Some(Some(Kind::StringValue(s))) => ItemId::Str(s.clone()),
        _ => match id.and_then(|p| p.point_id_options.as_ref()) {
            Some(PointIdOptions::Num(n)) => ItemId::Int(*n),
            Some(PointIdOptions::Uuid(s)) => ItemId::Str(s.clone()),
            None => ItemId::Str(String::new()),
        },
    };

    let metadata: Option<Metadata> = match payload.get(METADATA_FIELD).map(|v| &v.kind) {
        Some(Some(Kind::StructValue(s))) => {
            Some(s.fields.iter().map(|(k, v)| (k.clone(), metadata_value(v))).collect())
        }
        _ => None,
    };
    let model = extract_string(payload, MODEL_FIELD);

    let mut doc = Document::new(
        item_id,
        extract_string(payload, TITLE_KEY),
        extract_string(payload, CONTENT_FIELD),
    );
    doc.metadata = metadata;
    doc.embedding_model = (!model.is_empty()).then_some(model);
    doc
}

fn build_filter(filters: Option<&Metadata>, contains: Option<&str>) -> Option<Filter> {
    let mut conditions: Vec<Condition> = Vec::new();
    for (key, value) in filters.into_iter().flatten() {
        let field =
            if key == TITLE_KEY { TITLE_KEY.to_string() } else { format!("{METADATA_FIELD}.{key}") };
        let condition = match value {
            MetadataValue::Str(s) => Condition::matches(field, s.clone()),
            MetadataValue::Int(i) => Condition::matches(field, *i),
            MetadataValue::Bool(b) => Condition::matches(field, *b),
            MetadataValue::Float(_) | MetadataValue::Null => {
                debug!(key = %key, "qdrant cannot match this metadata value exactly, ignoring it");
                continue;
            }
        };
        conditions.push(condition);
    }
    if let Some(needle) = contains {
        conditions.push(Condition::matches_text(CONTENT_FIELD, needle));
    }
    (!conditions.is_empty()).then(|| Filter::must(conditions))
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn create_collection(
        &self,
        name: &str,
        overwrite: bool,
        get_or_create: bool,
    ) -> Result<Collection> {
        let exists = self.exists(name).await?;
        let plan = plan_create(name, exists, overwrite, get_or_create, || self.vector_size())?;
        let size = match plan {
            CreatePlan::Reuse => {
                debug!(collection = name, "qdrant collection already exists, reusing it");
                let descriptor = self.descriptor(name).await;
                self.state.write().await.active = Some(name.to_string());
                return Ok(descriptor);
            }
            CreatePlan::Create { size, replace } => {
                if replace {
                    self.client.delete_collection(name).await.map_err(Self::map_err)?;
                    debug!(collection = name, "dropped qdrant collection for overwrite");
                }
                size
            }
        };

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(
                        size,
                        qdrant_distance(self.options.distance),
                    )),
            )
            .await
            .map_err(Self::map_err)?;

        let descriptor = Collection::new(name, self.options.distance, self.embedding_model());
        let mut state = self.state.write().await;
        state.descriptors.insert(name.to_string(), descriptor.clone());
        state.active = Some(name.to_string());
        info!(collection = name, dimensions = size, "created qdrant collection");
        Ok(descriptor)
    }

    async fn get_collection(&self, name: Option<&str>) -> Result<Collection> {
        let name = self.resolve_name(name).await?;
        self.require(&name).await?;
        let descriptor = self.descriptor(&name).await;
        self.state.write().await.active = Some(name);
        Ok(descriptor)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.require(name).await?;
        self.client.delete_collection(name).await.map_err(Self::map_err)?;
        let mut state = self.state.write().await;
        state.descriptors.remove(name);
        if state.active.as_deref() == Some(name) {
            state.active = None;
        }
        info!(collection = name, "deleted qdrant collection");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.client.list_collections().await.map_err(Self::map_err)?;
        let mut names: Vec<String> = collections.collections.into_iter().map(|c| c.name).collect();
        names.sort();
        Ok(names)
    }

    async fn insert_docs(
        &self,
        docs: &[Document],
        collection: Option<&str>,
        upsert: bool,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let provided = check_insert_schema(docs)?;
        let name = self.resolve_name(collection).await?;
        self.require(&name).await?;
        if !provided {
            info!(
                collection = %name,
                "no content embedding provided, using the vector store's embedding function"
            );
        }

        for (start, end) in batches(docs.len(), self.options.batch_size) {
            let batch = &docs[start..end];

            if !upsert {
                let ids: Vec<ItemId> = batch.iter().map(|d| d.id.clone()).collect();
                if let Some(existing) = self.fetch_points(&name, &ids).await?.first() {
                    let doc = document_from_payload(existing.id.as_ref(), &existing.payload);
                    return Err(RagError::AlreadyExists(format!(
                        "document '{}' already exists in collection '{name}'",
                        doc.id
                    )));
                }
            }

            let vectors: Vec<Vec<f32>> = if provided {
                batch.iter().map(|d| d.content_embedding.clone().unwrap_or_default()).collect()
            } else {
                let texts: Vec<&str> = batch.iter().map(|d| d.content.as_str()).collect();
                self.embed_texts(&texts).await?
            };

            let mut points = Vec::with_capacity(batch.len());
            for (doc, vector) in batch.iter().zip(vectors) {
                points.push(PointStruct::new(point_id(&doc.id), vector, payload_for(doc)?));
            }

            self.client
                .upsert_points(UpsertPointsBuilder::new(name.as_str(), points).wait(true))
                .await
                .map_err(Self::map_err)?;
            debug!(
                collection = %name,
                start,
                end,
                total = docs.len(),
                upsert,
                "upserted batch to qdrant"
            );
        }
        Ok(())
    }

    async fn delete_docs(&self, ids: &[ItemId], collection: Option<&str>) -> Result<()> {
        let name = self.resolve_name(collection).await?;
        self.require(&name).await?;
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<PointId> = ids.iter().map(point_id).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(name.as_str())
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await
            .map_err(Self::map_err)?;

        debug!(collection = %name, count = ids.len(), "deleted points from qdrant");
        Ok(())
    }

    async fn get_docs_by_ids(
        &self,
        ids: Option<&[ItemId]>,
        collection: Option<&str>,
    ) -> Result<Vec<Document>> {
        let name = self.resolve_name(collection).await?;
        self.require(&name).await?;

        if let Some(ids) = ids {
            let points = self.fetch_points(&name, ids).await?;
            let mut by_id: HashMap<ItemId, Document> = points
                .iter()
                .map(|p| document_from_payload(p.id.as_ref(), &p.payload))
                .map(|d| (d.id.clone(), d))
                .collect();
            return Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect());
        }

        let mut documents = Vec::new();
        let mut offset: Option<PointId> = None;
        loop {
            let mut request =
                ScrollPointsBuilder::new(name.as_str()).limit(SCROLL_PAGE).with_payload(true);
            if let Some(offset) = offset.take() {
                request = request.offset(offset);
            }
            let page = self.client.scroll(request).await.map_err(Self::map_err)?;
            documents.extend(
                page.result.iter().map(|p| document_from_payload(p.id.as_ref(), &p.payload)),
            );
            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(documents)
    }

    async fn retrieve_docs(
        &self,
        queries: &[Query],
        collection: Option<&str>,
    ) -> Result<QueryResults> {
        check_queries(queries)?;
        let Some(first) = queries.first() else {
            return Ok(QueryResults::default());
        };
        let name = self.resolve_name(collection).await?;
        self.require(&name).await?;

        let missing: Vec<&str> =
            queries.iter().filter(|q| q.embedding.is_none()).map(|q| q.text.as_str()).collect();
        let mut computed = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            self.embed_texts(&missing).await?.into_iter()
        };

        let distance = self.descriptor(&name).await.distance;
        let filter = build_filter(first.filters.as_ref(), first.contains.as_deref());

        let mut results = QueryResults::default();
        for query in queries {
            let vector = query.embedding.clone().or_else(|| computed.next()).unwrap_or_default();
            let mut request = SearchPointsBuilder::new(name.as_str(), vector, first.k as u64)
                .with_payload(true);
            if let Some(filter) = &filter {
                request = request.filter(filter.clone());
            }
            let response = self.client.search_points(request).await.map_err(Self::map_err)?;

            let matches = response
                .result
                .iter()
                .map(|scored| {
                    let doc = document_from_payload(scored.id.as_ref(), &scored.payload);
                    QueryMatch::from_document(&doc, distance.from_similarity(scored.score))
                })
                .collect();
            results.push_query(matches);
        }

        debug!(collection = %name, queries = queries.len(), k = first.k, "searched qdrant");
        Ok(results)
    }
}
