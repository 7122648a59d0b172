use crate::doc::context::{Document, DocumentContext, SubspaceContext};
use crate::doc::value::{DataValue, eval_path};
use crate::error::QuillError;
use crate::storage::encoded::{encode_key_part, prefix_successor};
use crate::storage::kv::{DocTxn, MemoryKv, Prefetch};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

const DESCRIPTOR_SPACE: u8 = 0x00;
const DOCUMENT_SPACE: u8 = 0x01;
const INDEX_SPACE: u8 = 0x02;
const METADATA_SPACE: u8 = 0x03;

const COLLECTION_COUNTER_KEY: [u8; 2] = [DESCRIPTOR_SPACE, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStatus {
    Ready,
    Building,
}

/// Descriptor of a secondary index. Entry keys within the index subspace are
/// `encode(value_1) ++ … ++ encode(value_n) ++ encode(primary_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub paths: Vec<String>,
    pub status: IndexStatus,
    pub build_id: Option<u64>,
}

impl IndexInfo {
    pub fn ready(name: &str, paths: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            status: IndexStatus::Ready,
            build_id: None,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.paths.len() == 1
    }
}

/// Per-path encoded value parts of `doc` under `index`.
pub fn index_value_parts(doc: &DataValue, index: &IndexInfo) -> Vec<Vec<Vec<u8>>> {
    index
        .paths
        .iter()
        .map(|path| {
            eval_path(doc, path)
                .iter()
                .map(encode_key_part)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Concatenates one choice from each dimension, in order.
pub fn cartesian_concat(dimensions: &[Vec<Vec<u8>>]) -> Vec<Vec<u8>> {
    let mut acc: Vec<Vec<u8>> = vec![Vec::new()];
    for dimension in dimensions {
        acc = acc
            .iter()
            .flat_map(|prefix| {
                dimension
                    .iter()
                    .map(|part| [prefix.as_slice(), part.as_slice()].concat())
            })
            .collect();
    }
    acc
}

/// All index entry keys (relative to the index subspace) that `doc` with
/// primary key `pk` occupies under `index`.
pub fn index_entry_suffixes(doc: &DataValue, index: &IndexInfo, pk: &[u8]) -> Vec<Vec<u8>> {
    cartesian_concat(&index_value_parts(doc, index))
        .into_iter()
        .map(|values| [values.as_slice(), pk].concat())
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionDescriptor {
    id: u32,
}

/// Collection metadata independent of any transaction: where its documents,
/// indexes and metadata live in the keyspace, and which indexes are known.
pub struct UnboundCollection {
    name: String,
    id: u32,
    doc_prefix: Vec<u8>,
    index_root: Vec<u8>,
    meta_prefix: Vec<u8>,
    indexes: Vec<IndexInfo>,
}

impl UnboundCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc_prefix(&self) -> &[u8] {
        &self.doc_prefix
    }

    pub fn meta_prefix(&self) -> &[u8] {
        &self.meta_prefix
    }

    pub fn indexes(&self) -> &[IndexInfo] {
        &self.indexes
    }

    pub fn doc_subspace(&self, txn: &Rc<DocTxn>) -> SubspaceContext {
        SubspaceContext::new(txn.clone(), self.doc_prefix.clone())
    }

    pub fn index_subspace(&self, txn: &Rc<DocTxn>, index_name: &str) -> SubspaceContext {
        let prefix = [
            self.index_root.as_slice(),
            encode_key_part(&DataValue::text(index_name)).as_slice(),
        ]
        .concat();
        SubspaceContext::new(txn.clone(), prefix)
    }

    /// The ready index covering exactly `[path]`, if any.
    pub fn get_simple_index(&self, path: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|index| {
            index.status == IndexStatus::Ready
                && index.paths.len() == 1
                && index.paths[0] == path
        })
    }

    /// The ready compound index extending `base`'s paths by exactly `path`.
    pub fn get_compound_extension(&self, base: &IndexInfo, path: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|index| {
            index.status == IndexStatus::Ready
                && index.paths.len() == base.paths.len() + 1
                && index.paths.starts_with(&base.paths)
                && index.paths.last().map(String::as_str) == Some(path)
        })
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn bind(self: Rc<Self>, txn: &Rc<DocTxn>) -> BoundCollection {
        BoundCollection {
            collection: self,
            txn: txn.clone(),
        }
    }
}

/// A collection paired with a transaction.
pub struct BoundCollection {
    collection: Rc<UnboundCollection>,
    txn: Rc<DocTxn>,
}

impl BoundCollection {
    pub fn collection(&self) -> &Rc<UnboundCollection> {
        &self.collection
    }

    pub fn txn(&self) -> &Rc<DocTxn> {
        &self.txn
    }

    fn meta_ctx(&self) -> SubspaceContext {
        SubspaceContext::new(self.txn.clone(), self.collection.meta_prefix.clone())
    }

    fn version_key() -> Vec<u8> {
        encode_key_part(&DataValue::text("version"))
    }

    fn index_descriptor_key(name: &str) -> Vec<u8> {
        [
            encode_key_part(&DataValue::text("indexes")),
            encode_key_part(&DataValue::text(name)),
        ]
        .concat()
    }

    fn index_progress_key(name: &str) -> Vec<u8> {
        [
            encode_key_part(&DataValue::text("progress")),
            encode_key_part(&DataValue::text(name)),
        ]
        .concat()
    }

    pub async fn metadata_version(&self) -> Result<u64, QuillError> {
        let raw = self.meta_ctx().get(&Self::version_key()).await?;
        Ok(raw
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    pub async fn bump_metadata_version(&self) -> Result<(), QuillError> {
        let next = self.metadata_version().await? + 1;
        self.meta_ctx()
            .set(Self::version_key(), next.to_be_bytes().to_vec());
        Ok(())
    }

    pub fn document(&self, pk: &[u8]) -> DocumentContext {
        DocumentContext::new(self.collection.clone(), self.txn.clone(), pk.to_vec())
    }

    /// Stages a new document for insertion; the write happens at
    /// `commit_changes`. The document must carry an `_id` field.
    pub fn stage_insert(&self, value: DataValue) -> Result<Document, QuillError> {
        let id = value
            .field("_id")
            .cloned()
            .ok_or_else(|| QuillError::InvalidPlan("insert document requires _id".into()))?;
        let ctx = self.document(&encode_key_part(&id));
        ctx.stage_insert(value);
        Ok(Document::synthesized(ctx, None))
    }

    pub async fn list_index_descriptors(&self) -> Result<Vec<IndexInfo>, QuillError> {
        let lo = encode_key_part(&DataValue::text("indexes"));
        let hi = prefix_successor(&lo);
        let mut reader = self.meta_ctx().descendants(lo, hi, Prefetch::Unlimited);
        let mut descriptors = Vec::new();
        while let Some(pair) = reader.next().await? {
            let info: IndexInfo = serde_json::from_slice(&pair.value)
                .map_err(|e| QuillError::Decode(e.to_string()))?;
            descriptors.push(info);
        }
        Ok(descriptors)
    }

    pub async fn write_index_descriptor(&self, info: &IndexInfo) -> Result<(), QuillError> {
        let bytes =
            serde_json::to_vec(info).map_err(|e| QuillError::Decode(e.to_string()))?;
        self.meta_ctx()
            .set(Self::index_descriptor_key(&info.name), bytes);
        self.bump_metadata_version().await
    }

    pub fn set_index_progress(&self, name: &str, marker: Vec<u8>) {
        self.meta_ctx().set(Self::index_progress_key(name), marker);
    }

    pub fn clear_index_progress(&self, name: &str) {
        self.meta_ctx().clear(Self::index_progress_key(name));
    }
}

/// Opens and refreshes collection metadata.
#[derive(Clone)]
pub struct CollectionCatalog {
    store: MemoryKv,
}

impl CollectionCatalog {
    pub fn new(store: MemoryKv) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryKv {
        &self.store
    }

    fn descriptor_key(name: &str) -> Vec<u8> {
        [
            &[DESCRIPTOR_SPACE][..],
            encode_key_part(&DataValue::text(name)).as_slice(),
        ]
        .concat()
    }

    fn prefixes(id: u32) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let id_bytes = id.to_be_bytes();
        (
            [&[DOCUMENT_SPACE][..], id_bytes.as_slice()].concat(),
            [&[INDEX_SPACE][..], id_bytes.as_slice()].concat(),
            [&[METADATA_SPACE][..], id_bytes.as_slice()].concat(),
        )
    }

    /// Reads the collection's descriptor and index set, creating the
    /// descriptor on first use.
    pub async fn open(
        &self,
        txn: &Rc<DocTxn>,
        name: &str,
    ) -> Result<Rc<UnboundCollection>, QuillError> {
        let key = Self::descriptor_key(name);
        let id = match txn.get(&key).await? {
            Some(raw) => {
                let descriptor: CollectionDescriptor = serde_json::from_slice(&raw)
                    .map_err(|e| QuillError::Decode(e.to_string()))?;
                descriptor.id
            }
            None => {
                let next = match txn.get(&COLLECTION_COUNTER_KEY).await? {
                    Some(raw) => {
                        u32::from_be_bytes(raw.try_into().map_err(|_| {
                            QuillError::Decode("collection counter".into())
                        })?) + 1
                    }
                    None => 1,
                };
                txn.set(COLLECTION_COUNTER_KEY.to_vec(), next.to_be_bytes().to_vec());
                let descriptor = CollectionDescriptor { id: next };
                txn.set(
                    key,
                    serde_json::to_vec(&descriptor)
                        .map_err(|e| QuillError::Decode(e.to_string()))?,
                );
                next
            }
        };
        let (doc_prefix, index_root, meta_prefix) = Self::prefixes(id);
        let collection = Rc::new(UnboundCollection {
            name: name.to_string(),
            id,
            doc_prefix,
            index_root,
            meta_prefix,
            indexes: Vec::new(),
        });
        let indexes = collection.clone().bind(txn).list_index_descriptors().await?;
        Ok(Rc::new(UnboundCollection {
            name: collection.name.clone(),
            id: collection.id,
            doc_prefix: collection.doc_prefix.clone(),
            index_root: collection.index_root.clone(),
            meta_prefix: collection.meta_prefix.clone(),
            indexes,
        }))
    }

    /// Re-reads metadata for an already-open collection. Callers compare the
    /// returned prefixes against the ones they hold to detect relocation.
    pub async fn refresh(
        &self,
        current: &Rc<UnboundCollection>,
        txn: &Rc<DocTxn>,
    ) -> Result<Rc<UnboundCollection>, QuillError> {
        self.open(txn, &current.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_concat_covers_all_combinations() {
        let dims = vec![
            vec![vec![1u8], vec![2u8]],
            vec![vec![10u8], vec![20u8], vec![30u8]],
        ];
        let combos = cartesian_concat(&dims);
        assert_eq!(combos.len(), 6);
        assert!(combos.contains(&vec![1, 10]));
        assert!(combos.contains(&vec![2, 30]));
    }

    #[test]
    fn array_fields_produce_one_entry_per_element() {
        let doc: DataValue = serde_json::json!({"tags": ["x", "y"]}).into();
        let index = IndexInfo::ready("tags_1", &["tags"]);
        let suffixes = index_entry_suffixes(&doc, &index, b"pk");
        assert_eq!(suffixes.len(), 2);
        for suffix in &suffixes {
            assert!(suffix.ends_with(b"pk"));
        }
    }

    #[test]
    fn simple_index_lookup_skips_building_indexes(){
        let building = IndexInfo {
            status: IndexStatus::Building,
            ..IndexInfo::ready("tags_1", &["tags"])
        };
        let collection = UnboundCollection {
            name: "c".into(),
            id: 1,
            doc_prefix: vec![1],
            index_root: vec![2],
            meta_prefix: vec![3],
            indexes: vec![building, IndexInfo::ready("age_1", &["age"])],
        };
        assert!(collection.get_simple_index("tags").is_none());
        assert!(collection.get_simple_index("age").is_some());
    }
}
