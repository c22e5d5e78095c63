use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::cube::{Cube, UUID_SEPARATOR};
use crate::error::{CubeError, Result};
use crate::storage::BlobStore;

/// One immutable physical file of a dataset, labeled by its partition
/// column values. Replaced or deleted as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub key: String,
    /// Label pairs in the dataset's partition-on order.
    pub values: Vec<(String, String)>,
    pub num_rows: usize,
    pub num_bytes: usize,
}

impl Partition {
    pub fn value_of(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == column)
            .map(|(_, v)| v.as_str())
    }
}

/// Cube attributes embedded into every manifest so the cube specification
/// can be reconstructed from the store alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeAttributes {
    pub dimension_columns: Vec<String>,
    pub partition_columns: Vec<String>,
    pub seed_dataset: String,
    pub index_columns: Vec<String>,
    pub suppress_index_on: Vec<String>,
}

impl From<&Cube> for CubeAttributes {
    fn from(cube: &Cube) -> Self {
        Self {
            dimension_columns: cube.dimension_columns.clone(),
            partition_columns: cube.partition_columns.clone(),
            seed_dataset: cube.seed_dataset.clone(),
            index_columns: cube.index_columns.clone(),
            suppress_index_on: cube.suppress_index_on.clone(),
        }
    }
}

/// Persisted description of one dataset: schema, partitioning, user
/// metadata, embedded cube attributes and the tracked partitions.
///
/// The manifest blob is the per-dataset commit point: partitions are written
/// before it, deleted blobs are removed after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub uuid: String,
    /// Ordered column name -> dtype string.
    pub schema: Vec<(String, String)>,
    pub partition_on: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub cube: CubeAttributes,
    pub partitions: Vec<Partition>,
}

impl DatasetMetadata {
    pub fn name(&self) -> &str {
        self.uuid
            .split_once(UUID_SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or(&self.uuid)
    }

    pub fn columns(&self) -> BTreeSet<String> {
        self.schema.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.schema.iter().any(|(name, _)| name == column)
    }

    pub fn dtype_of(&self, column: &str) -> Option<&str> {
        self.schema
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, dtype)| dtype.as_str())
    }

    /// All tracked store keys of this dataset, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.partitions.iter().map(|p| p.key.clone()).collect();
        keys.push(manifest_key(&self.uuid));
        keys.sort();
        keys
    }

    /// Next free part file index. Indices grow monotonically across
    /// generations so an overwrite never reuses a live key.
    pub fn next_part_index(&self) -> usize {
        self.partitions
            .iter()
            .filter_map(|p| {
                let file = p.key.rsplit('/').next()?;
                file.strip_prefix("part-")?.split('.').next()?.parse().ok()
            })
            .max()
            .map(|max: usize| max + 1)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            partitions: self.partitions.len(),
            blobs: self.partitions.len() + 1,
            rows: self.partitions.iter().map(|p| p.num_rows).sum(),
            bytes: self.partitions.iter().map(|p| p.num_bytes).sum(),
        }
    }
}

/// Aggregated per-dataset statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub partitions: usize,
    /// Partition blobs plus the manifest.
    pub blobs: usize,
    pub rows: usize,
    pub bytes: usize,
}

pub fn manifest_key(uuid: &str) -> String {
    format!("{uuid}/manifest.json")
}

fn partition_key(uuid: &str, values: &[(String, String)], index: usize, ext: &str) -> String {
    let mut parts = vec![uuid.to_string()];
    for (column, value) in values {
        parts.push(format!("{column}={value}"));
    }
    parts.push(format!("part-{index:05}.{ext}"));
    parts.join("/")
}

pub(crate) fn dataset_name(uuid: &str) -> &str {
    uuid.split_once(UUID_SEPARATOR)
        .map(|(_, name)| name)
        .unwrap_or(uuid)
}

pub(crate) fn schema_of(df: &DataFrame) -> Vec<(String, String)> {
    df.get_columns()
        .iter()
        .map(|s| (s.name().to_string(), s.dtype().to_string()))
        .collect()
}

fn any_value_label(value: &AnyValue) -> Result<String> {
    let label = match value {
        AnyValue::Boolean(v) => v.to_string(),
        AnyValue::Utf8(v) => v.to_string(),
        AnyValue::Utf8Owned(v) => v.to_string(),
        AnyValue::UInt8(v) => v.to_string(),
        AnyValue::UInt16(v) => v.to_string(),
        AnyValue::UInt32(v) => v.to_string(),
        AnyValue::UInt64(v) => v.to_string(),
        AnyValue::Int8(v) => v.to_string(),
        AnyValue::Int16(v) => v.to_string(),
        AnyValue::Int32(v) => v.to_string(),
        AnyValue::Int64(v) => v.to_string(),
        AnyValue::Date(v) => v.to_string(),
        other => return Err(CubeError::PartitionValue(format!("{other:?}"))),
    };
    Ok(label)
}

/// Split a table into per-partition slices, labeled by the partition-on
/// column values of their first row, sorted by label.
pub(crate) fn split_into_partitions(
    df: DataFrame,
    partition_on: &[String],
) -> Result<Vec<(Vec<(String, String)>, DataFrame)>> {
    if partition_on.is_empty() {
        return Ok(vec![(Vec::new(), df)]);
    }
    let splits = df.partition_by(partition_on.to_vec(), true)?;
    let mut out = Vec::with_capacity(splits.len());
    for part in splits {
        let mut values = Vec::with_capacity(partition_on.len());
        for column in partition_on {
            let value = part.column(column)?.get(0)?;
            values.push((column.clone(), any_value_label(&value)?));
        }
        out.push((values, part));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn read_manifest(store: &dyn BlobStore, uuid: &str) -> Result<DatasetMetadata> {
    let bytes = store.get(&manifest_key(uuid))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_manifest(store: &dyn BlobStore, meta: &DatasetMetadata) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(meta)?;
    store.put(&manifest_key(&meta.uuid), &bytes)?;
    Ok(())
}

/// Write a fresh dataset: all partition blobs first, the manifest last as
/// the commit point. With `overwrite`, blobs of the previous generation stay
/// behind as untracked leftovers for `cleanup`.
pub fn create_dataset(
    store: &dyn BlobStore,
    codec: &Codec,
    cube: &Cube,
    name: &str,
    df: DataFrame,
    partition_on: &[String],
    metadata: serde_json::Map<String, serde_json::Value>,
    overwrite: bool,
) -> Result<DatasetMetadata> {
    let uuid = cube.dataset_uuid(name);
    let prior = match store.exists(&manifest_key(&uuid))? {
        true => Some(read_manifest(store, &uuid)?),
        false => None,
    };
    if prior.is_some() && !overwrite {
        return Err(CubeError::ExistingDatasetConflict(vec![name.to_string()]));
    }
    let start = prior.map(|m| m.next_part_index()).unwrap_or(0);

    let schema = schema_of(&df);
    let splits = split_into_partitions(df, partition_on)?;
    let mut partitions = Vec::with_capacity(splits.len());
    for (offset, (values, mut part)) in splits.into_iter().enumerate() {
        let num_rows = part.height();
        let bytes = codec.encode(&mut part)?;
        let key = partition_key(&uuid, &values, start + offset, codec.extension());
        store.put(&key, &bytes)?;
        partitions.push(Partition {
            key,
            values,
            num_rows,
            num_bytes: bytes.len(),
        });
    }

    let meta = DatasetMetadata {
        uuid,
        schema,
        partition_on: partition_on.to_vec(),
        metadata,
        cube: CubeAttributes::from(cube),
        partitions,
    };
    write_manifest(store, &meta)?;
    Ok(meta)
}

/// Update an existing dataset in place: append new partitions, drop the
/// given partition keys, merge metadata. The partitioning always comes from
/// the stored manifest. Dropped blobs are removed only after the manifest
/// stopped referencing them.
pub fn update_dataset(
    store: &dyn BlobStore,
    codec: &Codec,
    uuid: &str,
    df: Option<DataFrame>,
    delete_keys: &[String],
    metadata: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Result<DatasetMetadata> {
    if !store.exists(&manifest_key(uuid))? {
        return Err(CubeError::UnknownDataset(vec![dataset_name(uuid).to_string()]));
    }
    let mut meta = read_manifest(store, uuid)?;

    if let Some(df) = df {
        check_schema_compatible(&meta, &df)?;
        // Align to the stored column order before splitting.
        let columns: Vec<String> = meta.schema.iter().map(|(n, _)| n.clone()).collect();
        let df = df.select(columns)?;
        let partition_on = meta.partition_on.clone();
        let start = meta.next_part_index();
        let splits = split_into_partitions(df, &partition_on)?;
        for (offset, (values, mut part)) in splits.into_iter().enumerate() {
            let num_rows = part.height();
            let bytes = codec.encode(&mut part)?;
            let key = partition_key(uuid, &values, start + offset, codec.extension());
            store.put(&key, &bytes)?;
            meta.partitions.push(Partition {
                key,
                values,
                num_rows,
                num_bytes: bytes.len(),
            });
        }
    }

    if !delete_keys.is_empty() {
        let dropped: BTreeSet<&str> = delete_keys.iter().map(String::as_str).collect();
        meta.partitions.retain(|p| !dropped.contains(p.key.as_str()));
    }

    if let Some(patch) = metadata {
        for (key, value) in patch {
            meta.metadata.insert(key.clone(), value.clone());
        }
    }

    write_manifest(store, &meta)?;
    let mut dropped: Vec<&String> = delete_keys.iter().collect();
    dropped.sort();
    for key in dropped {
        store.delete(key)?;
    }
    Ok(meta)
}

fn check_schema_compatible(meta: &DatasetMetadata, df: &DataFrame) -> Result<()> {
    let stored: BTreeMap<&str, &str> = meta
        .schema
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_str()))
        .collect();
    let new = schema_of(df);
    let incoming: BTreeMap<&str, &str> = new.iter().map(|(n, d)| (n.as_str(), d.as_str())).collect();
    if stored != incoming {
        return Err(CubeError::Inconsistent(format!(
            "schema mismatch for dataset '{}': stored {:?}, appended {:?}",
            meta.name(),
            meta.schema,
            new
        )));
    }
    Ok(())
}

/// Tolerant discovery: parse every manifest under the cube prefix without
/// any cross-dataset validation. Used by the delete/cleanup/stats/copy
/// paths. `filter` quietly restricts the result to the given names.
pub fn discover_datasets_unchecked(
    store: &dyn BlobStore,
    uuid_prefix: &str,
    filter: Option<&[String]>,
) -> Result<BTreeMap<String, DatasetMetadata>> {
    let prefix = format!("{uuid_prefix}{UUID_SEPARATOR}");
    let mut out = BTreeMap::new();
    for key in store.keys_with_prefix(&prefix)? {
        let rest = &key[prefix.len()..];
        let name = match rest.strip_suffix("/manifest.json") {
            Some(name) if !name.is_empty() && !name.contains('/') => name,
            _ => continue,
        };
        if let Some(filter) = filter {
            if !filter.iter().any(|f| f == name) {
                continue;
            }
        }
        let bytes = store.get(&key)?;
        let meta: DatasetMetadata = serde_json::from_slice(&bytes)?;
        out.insert(name.to_string(), meta);
    }
    Ok(out)
}

/// Checked discovery: the seed dataset must exist and the dataset set must
/// be mutually consistent with the given cube specification.
pub fn discover_datasets(
    store: &dyn BlobStore,
    cube: &Cube,
) -> Result<BTreeMap<String, DatasetMetadata>> {
    let datasets = discover_datasets_unchecked(store, &cube.uuid_prefix, None)?;
    if !datasets.contains_key(&cube.seed_dataset) {
        return Err(CubeError::SeedNotFound {
            uuid_prefix: cube.uuid_prefix.clone(),
            seed: cube.seed_dataset.clone(),
        });
    }
    check_dataset_consistency(cube, &datasets)?;
    Ok(datasets)
}

/// Cross-dataset agreement: embedded cube attributes, dimension coverage,
/// partitioning columns present, and dtype agreement on shared columns.
pub(crate) fn check_dataset_consistency(
    cube: &Cube,
    datasets: &BTreeMap<String, DatasetMetadata>,
) -> Result<()> {
    let attrs = CubeAttributes::from(cube);
    let mut dtypes: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (name, ds) in datasets {
        if ds.cube != attrs {
            return Err(CubeError::Inconsistent(format!(
                "dataset '{name}' does not agree on the cube attributes"
            )));
        }
        let missing: Vec<String> = cube
            .dimension_columns
            .iter()
            .filter(|c| !ds.has_column(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CubeError::MissingDimensions {
                dataset: name.clone(),
                columns: missing,
            });
        }
        for column in &ds.partition_on {
            if !ds.has_column(column) {
                return Err(CubeError::Inconsistent(format!(
                    "dataset '{name}' is partitioned on '{column}' which is not in its schema"
                )));
            }
        }
        for (column, dtype) in &ds.schema {
            match dtypes.get(column) {
                Some((other, known)) if known != dtype => {
                    return Err(CubeError::Inconsistent(format!(
                        "column '{column}' is {known} in dataset '{other}' but {dtype} in dataset '{name}'"
                    )));
                }
                Some(_) => {}
                None => {
                    dtypes.insert(column.clone(), (name.clone(), dtype.clone()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use anyhow::Result;
    use polars::df;

    fn cube() -> Cube {
        Cube::new(
            "cube",
            vec!["x".to_string()],
            vec!["p".to_string()],
            "seed",
        )
        .unwrap()
    }

    fn seed_frame() -> DataFrame {
        df!("x" => [0i64, 1, 2, 3], "p" => [0i64, 0, 1, 1], "v" => [10i64, 20, 30, 40]).unwrap()
    }

    #[test]
    fn split_labels_and_order() -> Result<()> {
        let splits = split_into_partitions(seed_frame(), &["p".to_string()])?;
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0].0, vec![("p".to_string(), "0".to_string())]);
        assert_eq!(splits[1].0, vec![("p".to_string(), "1".to_string())]);
        assert_eq!(splits[0].1.height(), 2);

        let splits = split_into_partitions(seed_frame(), &[])?;
        assert_eq!(splits.len(), 1);
        assert!(splits[0].0.is_empty());
        assert_eq!(splits[0].1.height(), 4);
        Ok(())
    }

    #[test]
    fn create_then_discover() -> Result<()> {
        let store = MemoryStore::new();
        let codec = Codec::default();
        let cube = cube();
        let meta = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;
        assert_eq!(meta.uuid, "cube++seed");
        assert_eq!(meta.partitions.len(), 2);
        assert_eq!(meta.stats().rows, 4);
        assert_eq!(meta.next_part_index(), 2);

        let discovered = discover_datasets(&store, &cube)?;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered["seed"], meta);

        // A second build without overwrite must not touch the store.
        let err = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::ExistingDatasetConflict(_)));
        Ok(())
    }

    #[test]
    fn overwrite_leaves_stale_blobs_untracked() -> Result<()> {
        let store = MemoryStore::new();
        let codec = Codec::default();
        let cube = cube();
        let first = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;
        let second = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            true,
        )?;
        // Indices continued, so the first generation is still in the store
        // but no longer referenced.
        assert_eq!(second.next_part_index(), 4);
        for p in &first.partitions {
            assert!(store.exists(&p.key)?);
            assert!(!second.partitions.iter().any(|q| q.key == p.key));
        }
        Ok(())
    }

    #[test]
    fn update_appends_drops_and_merges_metadata() -> Result<()> {
        let store = MemoryStore::new();
        let codec = Codec::default();
        let cube = cube();
        let meta = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;

        let more = df!("x" => [4i64], "p" => [2i64], "v" => [50i64])?;
        let mut patch = serde_json::Map::new();
        patch.insert("source".to_string(), serde_json::json!("db"));
        let updated = update_dataset(&store, &codec, &meta.uuid, Some(more), &[], Some(&patch))?;
        assert_eq!(updated.partitions.len(), 3);
        assert_eq!(updated.metadata["source"], serde_json::json!("db"));

        let drop_key = updated.partitions[0].key.clone();
        let updated = update_dataset(&store, &codec, &meta.uuid, None, &[drop_key.clone()], None)?;
        assert_eq!(updated.partitions.len(), 2);
        assert!(!store.exists(&drop_key)?);

        let err = update_dataset(&store, &codec, "cube++nope", None, &[], None).unwrap_err();
        assert!(matches!(err, CubeError::UnknownDataset(_)));
        Ok(())
    }

    #[test]
    fn update_rejects_schema_drift() -> Result<()> {
        let store = MemoryStore::new();
        let codec = Codec::default();
        let cube = cube();
        let meta = create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;
        let drifted = df!("x" => [9i64], "p" => [0i64], "w" => [1i64])?;
        let err = update_dataset(&store, &codec, &meta.uuid, Some(drifted), &[], None).unwrap_err();
        assert!(matches!(err, CubeError::Inconsistent(_)));
        Ok(())
    }

    #[test]
    fn discovery_filters_and_checks() -> Result<()> {
        let store = MemoryStore::new();
        let codec = Codec::default();
        let cube = cube();
        create_dataset(
            &store,
            &codec,
            &cube,
            "seed",
            seed_frame(),
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;
        let enrich = df!("x" => [0i64, 1], "p" => [0i64, 0], "v2" => [true, false])?;
        create_dataset(
            &store,
            &codec,
            &cube,
            "enrich",
            enrich,
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;

        let only = discover_datasets_unchecked(&store, "cube", Some(&["enrich".to_string()]))?;
        assert_eq!(only.keys().collect::<Vec<_>>(), vec!["enrich"]);

        // Conflicting dtype on a shared column fails the checked variant.
        let bad = df!("x" => [0i64], "p" => [0i64], "v" => ["oops"])?;
        create_dataset(
            &store,
            &codec,
            &cube,
            "bad",
            bad,
            &["p".to_string()],
            serde_json::Map::new(),
            false,
        )?;
        let err = discover_datasets(&store, &cube).unwrap_err();
        assert!(matches!(err, CubeError::Inconsistent(_)));
        Ok(())
    }

    #[test]
    fn checked_discovery_requires_seed() {
        let store = MemoryStore::new();
        let err = discover_datasets(&store, &cube()).unwrap_err();
        assert!(matches!(err, CubeError::SeedNotFound { .. }));
    }
}
