use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use polars::prelude::*;

use crate::codec::Codec;
use crate::conditions::Conjunction;
use crate::cube::{Cube, UUID_SEPARATOR};
use crate::dataset::{
    create_dataset, discover_datasets, discover_datasets_unchecked, manifest_key, update_dataset,
    CubeAttributes, DatasetMetadata, DatasetStats,
};
use crate::error::{CubeError, Result};
use crate::observer::{Observer, Silent};
use crate::query::{load_group, plan_query, quick_concat, QueryRequest};
use crate::storage::{BlobStore, StoreSource};
use crate::write::{
    apply_postwrite_checks, check_extend_collisions, check_metadata_map, check_preappend,
    check_prebuild, check_preextend, cube_payload, normalize_input, prepare_all,
    resolve_partition_on, CubeInput, MetadataMap,
};

/// Options for `build` and `extend`.
#[derive(Default)]
pub struct WriteOptions {
    pub metadata: Option<MetadataMap>,
    pub overwrite: bool,
    pub partition_on: Option<BTreeMap<String, Vec<String>>>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_partition_on(mut self, partition_on: BTreeMap<String, Vec<String>>) -> Self {
        self.partition_on = Some(partition_on);
        self
    }
}

/// Options for `copy`.
#[derive(Default)]
pub struct CopyOptions {
    pub overwrite: bool,
    pub datasets: Option<Vec<String>>,
    pub renamed_cube_prefix: Option<String>,
    pub renamed_datasets: Option<BTreeMap<String, String>>,
}

impl CopyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_datasets<I, S>(mut self, datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datasets = Some(datasets.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_renamed_cube_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.renamed_cube_prefix = Some(prefix.into());
        self
    }

    pub fn with_renamed_datasets(mut self, renamed: BTreeMap<String, String>) -> Self {
        self.renamed_datasets = Some(renamed);
        self
    }
}

/// Entry point for all cube operations against one store.
///
/// The store is resolved from its source exactly once here; the codec and
/// the progress observer are fixed for the lifetime of the handle.
pub struct CubeIo {
    store: Arc<dyn BlobStore>,
    codec: Codec,
    observer: Box<dyn Observer>,
}

impl CubeIo {
    pub fn new(store: StoreSource) -> Result<Self> {
        Ok(Self::from_handle(store.resolve()?))
    }

    pub fn from_handle(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            codec: Codec::default(),
            observer: Box::new(Silent),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Store the given tables as a new cube.
    ///
    /// The seed dataset must be part of the input. If the cube already
    /// exists, `overwrite` must be set and all existing datasets must be
    /// rewritten; partial overwrites are rejected before any write.
    pub fn build(
        &self,
        cube: &Cube,
        data: CubeInput,
        options: WriteOptions,
    ) -> Result<BTreeMap<String, DatasetMetadata>> {
        let data = normalize_input(data, cube)?;
        let names: BTreeSet<String> = data.keys().cloned().collect();
        let partition_on = resolve_partition_on(cube, &names, options.partition_on)?;
        let metadata = check_metadata_map(options.metadata, &names)?;

        let existing = discover_datasets_unchecked(&*self.store, &cube.uuid_prefix, None)?;
        check_prebuild(cube, &names, &existing, options.overwrite)?;

        // All data preparation happens before anything is written.
        let data = prepare_all(data, cube, &BTreeSet::new(), &partition_on)?;

        let mut written = BTreeMap::new();
        for (name, df) in data {
            let rows = df.height();
            let meta = create_dataset(
                &*self.store,
                &self.codec,
                cube,
                &name,
                df,
                &partition_on[&name],
                metadata.get(&name).cloned().unwrap_or_default(),
                options.overwrite,
            )?;
            self.observer
                .dataset_written(&name, meta.partitions.len(), rows);
            written.insert(name, meta);
        }

        apply_postwrite_checks(&*self.store, cube, &written, &existing)
    }

    /// Store new datasets into an existing cube. The seed dataset cannot be
    /// extended; colliding dataset names require `overwrite`.
    pub fn extend(
        &self,
        cube: &Cube,
        data: CubeInput,
        options: WriteOptions,
    ) -> Result<BTreeMap<String, DatasetMetadata>> {
        let data = normalize_input(data, cube)?;
        let names: BTreeSet<String> = data.keys().cloned().collect();
        let partition_on = resolve_partition_on(cube, &names, options.partition_on)?;
        let metadata = check_metadata_map(options.metadata, &names)?;

        check_preextend(cube, &names)?;
        let existing = discover_datasets(&*self.store, cube)?;
        check_extend_collisions(&names, &existing, options.overwrite)?;

        // Payload of datasets that stay in place must not be duplicated.
        let kept: BTreeMap<String, DatasetMetadata> = existing
            .iter()
            .filter(|(name, _)| !(options.overwrite && names.contains(*name)))
            .map(|(name, ds)| (name.clone(), ds.clone()))
            .collect();
        let existing_payload = cube_payload(&kept, cube);

        let data = prepare_all(data, cube, &existing_payload, &partition_on)?;

        let mut written = BTreeMap::new();
        for (name, df) in data {
            let rows = df.height();
            let meta = create_dataset(
                &*self.store,
                &self.codec,
                cube,
                &name,
                df,
                &partition_on[&name],
                metadata.get(&name).cloned().unwrap_or_default(),
                options.overwrite,
            )?;
            self.observer
                .dataset_written(&name, meta.partitions.len(), rows);
            written.insert(name, meta);
        }

        apply_postwrite_checks(&*self.store, cube, &written, &existing)
    }

    /// Append data to existing datasets. Partitioning is inherited from the
    /// stored manifests; physical partitions are added, never patched.
    pub fn append(
        &self,
        cube: &Cube,
        data: CubeInput,
        metadata: Option<MetadataMap>,
    ) -> Result<BTreeMap<String, DatasetMetadata>> {
        let data = normalize_input(data, cube)?;
        let names: BTreeSet<String> = data.keys().cloned().collect();

        let existing = discover_datasets(&*self.store, cube)?;
        check_preappend(&names, &existing)?;
        let metadata = check_metadata_map(metadata, &names)?;

        let partition_on: BTreeMap<String, Vec<String>> = names
            .iter()
            .map(|name| (name.clone(), existing[name].partition_on.clone()))
            .collect();

        let data = prepare_all(data, cube, &BTreeSet::new(), &partition_on)?;

        let mut written = BTreeMap::new();
        for (name, df) in data {
            let rows = df.height();
            let meta = update_dataset(
                &*self.store,
                &self.codec,
                &existing[&name].uuid,
                Some(df),
                &[],
                metadata.get(&name),
            )?;
            self.observer
                .dataset_written(&name, meta.partitions.len(), rows);
            written.insert(name, meta);
        }

        apply_postwrite_checks(&*self.store, cube, &written, &existing)
    }

    /// Remove the partitions selected by `conditions` from the given
    /// datasets (all by default). Conditions may reference only partition
    /// columns; a dataset with no partitioning is always fully selected.
    pub fn remove_partitions(
        &self,
        cube: &Cube,
        conditions: Option<&Conjunction>,
        datasets: Option<&[String]>,
        metadata: Option<MetadataMap>,
    ) -> Result<BTreeMap<String, DatasetMetadata>> {
        let mut existing = discover_datasets(&*self.store, cube)?;

        let targets: Vec<String> = match datasets {
            None => existing.keys().cloned().collect(),
            Some(names) => {
                let unknown: Vec<String> = names
                    .iter()
                    .filter(|n| !existing.contains_key(*n))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(CubeError::UnknownDataset(unknown));
                }
                names.to_vec()
            }
        };
        let target_set: BTreeSet<String> = targets.iter().cloned().collect();
        let metadata = check_metadata_map(metadata, &target_set)?;

        if let Some(conditions) = conditions {
            let invalid: Vec<String> = conditions
                .columns()
                .into_iter()
                .filter(|c| !cube.partition_columns.contains(c))
                .collect();
            if !invalid.is_empty() {
                return Err(CubeError::InvalidConditionColumns(invalid));
            }
        }

        for name in &target_set {
            let ds = &existing[name];
            let partition_columns: BTreeSet<String> = ds.partition_on.iter().cloned().collect();
            let selected: Vec<String> = ds
                .partitions
                .iter()
                .filter(|p| match conditions {
                    Some(conditions) => conditions
                        .restrict_to(&partition_columns)
                        .matches_partition(&p.values),
                    None => true,
                })
                .map(|p| p.key.clone())
                .collect();
            let count = selected.len();
            let updated = update_dataset(
                &*self.store,
                &self.codec,
                &ds.uuid,
                None,
                &selected,
                metadata.get(name),
            )?;
            self.observer.keys_deleted(count);
            existing.insert(name.clone(), updated);
        }

        Ok(existing)
    }

    /// Query the cube. Returns one table per non-empty retrieval group;
    /// without `partition_by` all groups are concatenated into one table.
    pub fn query(&self, cube: &Cube, request: &QueryRequest) -> Result<Vec<DataFrame>> {
        let plan = plan_query(&*self.store, cube, request)?;
        let mut frames = Vec::new();
        for group in &plan.groups {
            let df = load_group(&*self.store, &self.codec, cube, &plan, group)?;
            if df.height() > 0 {
                self.observer.group_loaded(group.partitions.len(), df.height());
                frames.push(df);
            }
        }
        if plan.partition_by.is_empty() && !frames.is_empty() {
            frames = vec![quick_concat(
                frames,
                &plan.dimension_columns,
                &cube.partition_columns,
            )?];
        }
        Ok(frames)
    }

    /// Delete the given datasets (all by default). Only tracked keys are
    /// removed; leftovers from failed operations stay behind for `cleanup`.
    pub fn delete(&self, cube: &Cube, datasets: Option<&[String]>) -> Result<()> {
        let datasets =
            discover_datasets_unchecked(&*self.store, &cube.uuid_prefix, datasets)?;
        let mut keys = BTreeSet::new();
        for ds in datasets.values() {
            keys.extend(ds.keys());
        }
        let count = keys.len();
        for key in keys {
            self.store.delete(&key)?;
        }
        self.observer.keys_deleted(count);
        Ok(())
    }

    /// Delete every key under the cube prefix that no tracked dataset
    /// references; returns how many were removed.
    pub fn cleanup(&self, cube: &Cube) -> Result<usize> {
        let datasets = discover_datasets_unchecked(&*self.store, &cube.uuid_prefix, None)?;
        let mut tracked = BTreeSet::new();
        for ds in datasets.values() {
            tracked.extend(ds.keys());
        }
        let prefix = format!("{}{}", cube.uuid_prefix, UUID_SEPARATOR);
        let orphans: Vec<String> = self
            .store
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter(|key| !tracked.contains(key))
            .collect();
        let count = orphans.len();
        for key in &orphans {
            self.store.delete(key)?;
        }
        self.observer.keys_deleted(count);
        Ok(count)
    }

    /// Copy the cube into another store, optionally renaming the cube
    /// prefix and/or individual datasets by literal substring substitution
    /// on the dataset uuids.
    pub fn copy(
        &self,
        cube: &Cube,
        target: &StoreSource,
        options: CopyOptions,
    ) -> Result<BTreeMap<String, DatasetMetadata>> {
        let target = target.resolve()?;
        if Arc::ptr_eq(&self.store, &target) {
            return Err(CubeError::InvalidCube(
                "source and target stores must differ".to_string(),
            ));
        }

        let sources = discover_datasets_unchecked(
            &*self.store,
            &cube.uuid_prefix,
            options.datasets.as_deref(),
        )?;
        if let Some(names) = &options.datasets {
            let unknown: Vec<String> = names
                .iter()
                .filter(|n| !sources.contains_key(*n))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(CubeError::UnknownDataset(unknown));
            }
        }

        let renamed_datasets = options.renamed_datasets.clone().unwrap_or_default();
        let new_prefix = options
            .renamed_cube_prefix
            .clone()
            .unwrap_or_else(|| cube.uuid_prefix.clone());
        let new_cube = Cube {
            uuid_prefix: new_prefix.clone(),
            seed_dataset: renamed_datasets
                .get(&cube.seed_dataset)
                .cloned()
                .unwrap_or_else(|| cube.seed_dataset.clone()),
            ..cube.clone()
        };

        let existing_target = discover_datasets_unchecked(&*target, &new_prefix, None)?;
        if !options.overwrite {
            let clash: Vec<String> = sources
                .keys()
                .map(|name| renamed_datasets.get(name).unwrap_or(name).clone())
                .filter(|name| existing_target.contains_key(name))
                .collect();
            if !clash.is_empty() {
                return Err(CubeError::ExistingDatasetConflict(clash));
            }
        }

        let mut copied = BTreeMap::new();
        for (name, ds) in &sources {
            let new_name = renamed_datasets.get(name).unwrap_or(name).clone();
            match self.copy_one(ds, &*target, cube, &options, &new_cube) {
                Ok(meta) => {
                    self.observer.dataset_copied(&new_name, meta.keys().len());
                    copied.insert(new_name, meta);
                }
                Err(cause) => {
                    if options.overwrite {
                        // A partially overwritten target cannot be inspected
                        // safely; nothing to validate, escalate.
                        return Err(CubeError::CopyFatal(Box::new(cause)));
                    }
                    apply_postwrite_checks(&*target, &new_cube, &copied, &existing_target)?;
                    return Err(CubeError::CopyAborted {
                        copied: copied.keys().cloned().collect(),
                        cause: Box::new(cause),
                    });
                }
            }
        }
        Ok(copied)
    }

    fn copy_one(
        &self,
        ds: &DatasetMetadata,
        target: &dyn BlobStore,
        cube: &Cube,
        options: &CopyOptions,
        new_cube: &Cube,
    ) -> Result<DatasetMetadata> {
        let mut meta = ds.clone();
        meta.uuid = transform_uuid(
            &ds.uuid,
            &cube.uuid_prefix,
            options.renamed_cube_prefix.as_deref(),
            options.renamed_datasets.as_ref(),
        );
        meta.cube = CubeAttributes::from(new_cube);
        for partition in &mut meta.partitions {
            let new_key = transform_uuid(
                &partition.key,
                &cube.uuid_prefix,
                options.renamed_cube_prefix.as_deref(),
                options.renamed_datasets.as_ref(),
            );
            let bytes = self.store.get(&partition.key)?;
            target.put(&new_key, &bytes)?;
            partition.key = new_key;
        }
        let bytes = serde_json::to_vec_pretty(&meta)?;
        target.put(&manifest_key(&meta.uuid), &bytes)?;
        Ok(meta)
    }

    /// Aggregate per-partition statistics for the given datasets.
    pub fn stats(
        &self,
        cube: &Cube,
        datasets: Option<&[String]>,
    ) -> Result<BTreeMap<String, DatasetStats>> {
        let datasets =
            discover_datasets_unchecked(&*self.store, &cube.uuid_prefix, datasets)?;
        Ok(datasets
            .into_iter()
            .map(|(name, ds)| (name, ds.stats()))
            .collect())
    }
}

/// Literal substring substitution on `<prefix>++<dataset>` uuids and keys.
fn transform_uuid(
    src: &str,
    cube_prefix: &str,
    renamed_cube_prefix: Option<&str>,
    renamed_datasets: Option<&BTreeMap<String, String>>,
) -> String {
    let mut out = src.to_string();
    if let Some(new_prefix) = renamed_cube_prefix {
        out = out.replace(
            &format!("{cube_prefix}{UUID_SEPARATOR}"),
            &format!("{new_prefix}{UUID_SEPARATOR}"),
        );
    }
    if let Some(renamed) = renamed_datasets {
        for (old, new) in renamed {
            let needle = format!("{UUID_SEPARATOR}{old}");
            if out.contains(&needle) {
                out = out.replace(&needle, &format!("{UUID_SEPARATOR}{new}"));
            }
        }
    }
    out
}
