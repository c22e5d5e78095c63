use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;

use crate::cube::{check_name, Cube};
use crate::dataset::{discover_datasets, DatasetMetadata};
use crate::error::{CubeError, Result};
use crate::storage::BlobStore;

/// Per-dataset user metadata: dataset name -> JSON object.
pub type MetadataMap = BTreeMap<String, serde_json::Map<String, serde_json::Value>>;

/// Caller-supplied data for one commit: a single table (assigned to the
/// seed dataset), a mapping of named tables, or a sequence of either.
pub enum CubeInput {
    Table(DataFrame),
    Named(Vec<(String, DataFrame)>),
    Sequence(Vec<CubeInput>),
}

impl CubeInput {
    pub fn named<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (S, DataFrame)>,
        S: Into<String>,
    {
        CubeInput::Named(
            tables
                .into_iter()
                .map(|(name, df)| (name.into(), df))
                .collect(),
        )
    }
}

impl From<DataFrame> for CubeInput {
    fn from(df: DataFrame) -> Self {
        CubeInput::Table(df)
    }
}

/// Validated data of one dataset, ready to commit, or the explicit no-data
/// marker. Never an absent value: every consumer has to branch.
#[derive(Debug)]
pub enum DataPart {
    Table(DataFrame),
    NoData,
}

impl DataPart {
    pub fn is_no_data(&self) -> bool {
        matches!(self, DataPart::NoData)
    }
}

/// Flatten caller input into one concatenated table per dataset name,
/// preserving row order within each name.
pub(crate) fn normalize_input(
    input: CubeInput,
    cube: &Cube,
) -> Result<BTreeMap<String, DataFrame>> {
    let mut acc: BTreeMap<String, Vec<DataFrame>> = BTreeMap::new();
    collect_input(input, cube, &mut acc, true)?;

    let mut out = BTreeMap::new();
    for (name, mut frames) in acc {
        let df = if frames.len() == 1 {
            frames.pop().unwrap()
        } else {
            concat_aligned(&name, frames)?
        };
        out.insert(name, df);
    }
    Ok(out)
}

fn collect_input(
    input: CubeInput,
    cube: &Cube,
    acc: &mut BTreeMap<String, Vec<DataFrame>>,
    top_level: bool,
) -> Result<()> {
    match input {
        CubeInput::Table(df) => {
            acc.entry(cube.seed_dataset.clone()).or_default().push(df);
        }
        CubeInput::Named(tables) => {
            for (name, df) in tables {
                check_name(&name, "dataset name").map_err(|e| CubeError::Shape(e.to_string()))?;
                acc.entry(name).or_default().push(df);
            }
        }
        CubeInput::Sequence(elements) => {
            if !top_level {
                return Err(CubeError::Shape(
                    "sequence elements must be a table or a name-to-table mapping".to_string(),
                ));
            }
            for element in elements {
                collect_input(element, cube, acc, false)?;
            }
        }
    }
    Ok(())
}

fn concat_aligned(name: &str, frames: Vec<DataFrame>) -> Result<DataFrame> {
    let columns: Vec<String> = frames[0]
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let want: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
    let mut aligned = Vec::with_capacity(frames.len());
    for df in frames {
        let have: BTreeSet<&str> = df.get_column_names().into_iter().collect();
        if have != want {
            return Err(CubeError::Shape(format!(
                "tables for dataset '{name}' have mismatching columns: {want:?} vs {have:?}"
            )));
        }
        aligned.push(df.select(columns.clone())?.lazy());
    }
    Ok(concat(aligned, UnionArgs::default())?.collect()?)
}

/// Effective partition-on columns per dataset: the requested override or
/// the cube's partition columns. The seed dataset is always partitioned
/// exactly by the cube's partition columns.
pub(crate) fn resolve_partition_on(
    cube: &Cube,
    names: &BTreeSet<String>,
    requested: Option<BTreeMap<String, Vec<String>>>,
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut out: BTreeMap<String, Vec<String>> = names
        .iter()
        .map(|name| (name.clone(), cube.partition_columns.clone()))
        .collect();
    if let Some(requested) = requested {
        for (name, columns) in requested {
            if !names.contains(&name) {
                return Err(CubeError::UnknownDataset(vec![name]));
            }
            if cube.is_seed(&name) && columns != cube.partition_columns {
                return Err(CubeError::InvalidPartitionOn {
                    dataset: name,
                    reason: "the seed dataset must be partitioned by the cube partition columns"
                        .to_string(),
                });
            }
            if let Some(dim) = columns.iter().find(|c| cube.dimension_columns.contains(c)) {
                return Err(CubeError::InvalidPartitionOn {
                    dataset: name,
                    reason: format!("dimension column '{dim}' cannot be a partition column"),
                });
            }
            out.insert(name, columns);
        }
    }
    Ok(out)
}

/// User metadata may only reference datasets of this commit.
pub(crate) fn check_metadata_map(
    metadata: Option<MetadataMap>,
    names: &BTreeSet<String>,
) -> Result<MetadataMap> {
    let metadata = metadata.unwrap_or_default();
    let unknown: Vec<String> = metadata
        .keys()
        .filter(|name| !names.contains(*name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(CubeError::UnknownDataset(unknown));
    }
    Ok(metadata)
}

/// Payload columns already persisted by the given datasets: everything
/// outside dimensions and partitioning.
pub(crate) fn cube_payload(
    datasets: &BTreeMap<String, DatasetMetadata>,
    cube: &Cube,
) -> BTreeSet<String> {
    let mut payload = BTreeSet::new();
    for ds in datasets.values() {
        for (column, _) in &ds.schema {
            if !cube.dimension_columns.contains(column)
                && !cube.partition_columns.contains(column)
                && !ds.partition_on.contains(column)
            {
                payload.insert(column.clone());
            }
        }
    }
    payload
}

/// Validate one dataset's table and produce its data part.
pub(crate) fn prepare_data_part(
    name: &str,
    df: DataFrame,
    cube: &Cube,
    existing_payload: &BTreeSet<String>,
    partition_on: &[String],
) -> Result<DataPart> {
    if df.height() == 0 {
        return Ok(DataPart::NoData);
    }
    let columns: BTreeSet<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let missing: Vec<String> = cube
        .dimension_columns
        .iter()
        .filter(|c| !columns.contains(*c))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(CubeError::MissingDimensions {
            dataset: name.to_string(),
            columns: missing,
        });
    }

    if let Some(absent) = partition_on.iter().find(|c| !columns.contains(*c)) {
        return Err(CubeError::InvalidPartitionOn {
            dataset: name.to_string(),
            reason: format!("partition column '{absent}' is not in the table"),
        });
    }

    let clashing: Vec<String> = columns
        .iter()
        .filter(|c| {
            !cube.dimension_columns.contains(*c)
                && !cube.partition_columns.contains(*c)
                && !partition_on.contains(*c)
                && existing_payload.contains(*c)
        })
        .cloned()
        .collect();
    if !clashing.is_empty() {
        return Err(CubeError::PayloadConflict {
            dataset: name.to_string(),
            columns: clashing,
        });
    }

    // Logical row identity: dimensions plus physical partitioning.
    let mut key_columns: Vec<String> = cube.dimension_columns.clone();
    for column in partition_on {
        if !key_columns.contains(column) {
            key_columns.push(column.clone());
        }
    }
    let keys = df.select(key_columns.clone())?;
    if keys.unique(None, UniqueKeepStrategy::First, None)?.height() != df.height() {
        return Err(CubeError::NonUniqueRows {
            dataset: name.to_string(),
            columns: key_columns,
        });
    }

    Ok(DataPart::Table(df))
}

/// Prepare every dataset of the commit; abort before any write when one of
/// them resolved to no data.
pub(crate) fn prepare_all(
    data: BTreeMap<String, DataFrame>,
    cube: &Cube,
    existing_payload: &BTreeSet<String>,
    partition_on: &BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, DataFrame>> {
    // Datasets of the same commit must not duplicate payload either, so the
    // payload set grows as the (name-sorted) datasets are prepared.
    let mut seen_payload = existing_payload.clone();
    let mut parts: BTreeMap<String, DataPart> = BTreeMap::new();
    for (name, df) in data {
        let part = prepare_data_part(&name, df, cube, &seen_payload, &partition_on[&name])?;
        if let DataPart::Table(df) = &part {
            for column in df.get_column_names() {
                if !cube.dimension_columns.iter().any(|c| c == column)
                    && !cube.partition_columns.iter().any(|c| c == column)
                    && !partition_on[&name].iter().any(|c| c == column)
                {
                    seen_payload.insert(column.to_string());
                }
            }
        }
        parts.insert(name, part);
    }

    let empty: Vec<String> = parts
        .iter()
        .filter(|(_, part)| part.is_no_data())
        .map(|(name, _)| name.clone())
        .collect();
    if !empty.is_empty() {
        return Err(CubeError::CommitAborted {
            datasets: empty.clone(),
            cause: Box::new(CubeError::EmptyDatasets(empty)),
        });
    }

    Ok(parts
        .into_iter()
        .map(|(name, part)| match part {
            DataPart::Table(df) => (name, df),
            DataPart::NoData => unreachable!("empty datasets abort the commit"),
        })
        .collect())
}

/// Build preconditions: the seed must be part of the commit and an existing
/// cube may only be rewritten as a whole.
pub(crate) fn check_prebuild(
    cube: &Cube,
    names: &BTreeSet<String>,
    existing: &BTreeMap<String, DatasetMetadata>,
    overwrite: bool,
) -> Result<()> {
    if !names.contains(&cube.seed_dataset) {
        return Err(CubeError::MissingSeed(cube.seed_dataset.clone()));
    }
    if existing.is_empty() {
        return Ok(());
    }
    if !overwrite {
        let clash: Vec<String> = existing
            .keys()
            .filter(|name| names.contains(*name))
            .cloned()
            .collect();
        if !clash.is_empty() {
            return Err(CubeError::ExistingDatasetConflict(clash));
        }
        Ok(())
    } else {
        let missing: Vec<String> = existing
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CubeError::PartialOverwrite { missing });
        }
        Ok(())
    }
}

/// Extend preconditions: the seed dataset cannot be extended.
pub(crate) fn check_preextend(cube: &Cube, names: &BTreeSet<String>) -> Result<()> {
    if names.contains(&cube.seed_dataset) {
        return Err(CubeError::InvalidCube(format!(
            "cannot extend the seed dataset '{}'",
            cube.seed_dataset
        )));
    }
    Ok(())
}

pub(crate) fn check_extend_collisions(
    names: &BTreeSet<String>,
    existing: &BTreeMap<String, DatasetMetadata>,
    overwrite: bool,
) -> Result<()> {
    if overwrite {
        return Ok(());
    }
    let clash: Vec<String> = names
        .iter()
        .filter(|name| existing.contains_key(*name))
        .cloned()
        .collect();
    if !clash.is_empty() {
        return Err(CubeError::ExistingDatasetConflict(clash));
    }
    Ok(())
}

/// Append preconditions: every target must already exist.
pub(crate) fn check_preappend(
    names: &BTreeSet<String>,
    existing: &BTreeMap<String, DatasetMetadata>,
) -> Result<()> {
    let unknown: Vec<String> = names
        .iter()
        .filter(|name| !existing.contains_key(*name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(CubeError::UnknownDataset(unknown));
    }
    Ok(())
}

/// Re-discover the cube after the write phase and verify that nothing that
/// existed before (and nothing just written) has gone missing. Violations
/// do not undo completed writes.
pub(crate) fn apply_postwrite_checks(
    store: &dyn BlobStore,
    cube: &Cube,
    written: &BTreeMap<String, DatasetMetadata>,
    existing_before: &BTreeMap<String, DatasetMetadata>,
) -> Result<BTreeMap<String, DatasetMetadata>> {
    let verify = || -> Result<()> {
        let after = discover_datasets(store, cube)?;
        let expected: BTreeSet<&String> =
            existing_before.keys().chain(written.keys()).collect();
        for name in expected {
            if !after.contains_key(name) {
                return Err(CubeError::Inconsistent(format!(
                    "dataset '{name}' disappeared during the commit"
                )));
            }
        }
        Ok(())
    };
    match verify() {
        Ok(()) => Ok(written.clone()),
        Err(cause) => Err(CubeError::Integrity {
            reason: "post-write verification failed".to_string(),
            cause: Box::new(cause),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_table_becomes_seed() -> Result<()> {
        let df = df!("x" => [0i64], "p" => [0i64])?;
        let data = normalize_input(CubeInput::Table(df), &cube())?;
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["seed"]);
        Ok(())
    }

    #[test]
    fn sequence_concatenates_in_encounter_order() -> Result<()> {
        let first = df!("x" => [0i64], "p" => [0i64])?;
        let second = df!("p" => [1i64], "x" => [1i64])?; // same columns, other order
        let input = CubeInput::Sequence(vec![
            CubeInput::Table(first),
            CubeInput::named([("seed", second)]),
        ]);
        let data = normalize_input(input, &cube())?;
        let seed = &data["seed"];
        assert_eq!(seed.height(), 2);
        assert_eq!(seed.column("x")?.get(0)?, AnyValue::Int64(0));
        assert_eq!(seed.column("x")?.get(1)?, AnyValue::Int64(1));
        Ok(())
    }

    #[test]
    fn nested_sequence_is_a_shape_error() {
        let input = CubeInput::Sequence(vec![CubeInput::Sequence(vec![])]);
        let err = normalize_input(input, &cube()).unwrap_err();
        assert!(matches!(err, CubeError::Shape(_)));
    }

    #[test]
    fn mismatching_columns_are_a_shape_error() -> Result<()> {
        let first = df!("x" => [0i64], "p" => [0i64])?;
        let second = df!("x" => [1i64], "q" => [1i64])?;
        let input = CubeInput::Sequence(vec![
            CubeInput::Table(first),
            CubeInput::Table(second),
        ]);
        let err = normalize_input(input, &cube()).unwrap_err();
        assert!(matches!(err, CubeError::Shape(_)));
        Ok(())
    }

    #[test]
    fn prepare_validates_dimensions_and_uniqueness() -> Result<()> {
        let cube = cube();
        let partition_on = vec!["p".to_string()];

        let df = df!("p" => [0i64], "v" => [1i64])?;
        let err = prepare_data_part("seed", df, &cube, &BTreeSet::new(), &partition_on).unwrap_err();
        assert!(matches!(err, CubeError::MissingDimensions { .. }));

        let df = df!("x" => [0i64], "v" => [1i64])?;
        let err = prepare_data_part("seed", df, &cube, &BTreeSet::new(), &partition_on).unwrap_err();
        assert!(matches!(err, CubeError::InvalidPartitionOn { .. }));

        let df = df!("x" => [0i64, 0], "p" => [0i64, 0], "v" => [1i64, 2])?;
        let err = prepare_data_part("seed", df, &cube, &BTreeSet::new(), &partition_on).unwrap_err();
        assert!(matches!(err, CubeError::NonUniqueRows { .. }));

        let df = df!("x" => [0i64], "p" => [0i64], "v" => [1i64])?;
        let part = prepare_data_part("seed", df, &cube, &BTreeSet::new(), &partition_on)?;
        assert!(!part.is_no_data());
        Ok(())
    }

    #[test]
    fn zero_rows_is_the_no_data_sentinel() -> Result<()> {
        let df = df!("x" => Vec::<i64>::new(), "p" => Vec::<i64>::new())?;
        let part = prepare_data_part("seed", df, &cube(), &BTreeSet::new(), &["p".to_string()])?;
        assert!(part.is_no_data());
        Ok(())
    }

    #[test]
    fn empty_dataset_aborts_the_commit() -> Result<()> {
        let cube = cube();
        let mut data = BTreeMap::new();
        data.insert("seed".to_string(), df!("x" => [0i64], "p" => [0i64])?);
        data.insert(
            "enrich".to_string(),
            df!("x" => Vec::<i64>::new(), "p" => Vec::<i64>::new(), "v2" => Vec::<i64>::new())?,
        );
        let partition_on = resolve_partition_on(&cube, &names(&["seed", "enrich"]), None)?;
        let err = prepare_all(data, &cube, &BTreeSet::new(), &partition_on).unwrap_err();
        match err {
            CubeError::CommitAborted { datasets, cause } => {
                assert_eq!(datasets, vec!["enrich".to_string()]);
                assert!(matches!(*cause, CubeError::EmptyDatasets(_)));
            }
            other => panic!("expected CommitAborted, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn payload_conflict_is_detected() -> Result<()> {
        let cube = cube();
        let existing: BTreeSet<String> = ["v2".to_string()].into_iter().collect();
        let df = df!("x" => [0i64], "p" => [0i64], "v2" => [true])?;
        let err =
            prepare_data_part("other", df, &cube, &existing, &["p".to_string()]).unwrap_err();
        assert!(matches!(err, CubeError::PayloadConflict { .. }));
        Ok(())
    }

    #[test]
    fn partition_on_rules() -> Result<()> {
        let cube = cube();
        let all = names(&["seed", "enrich"]);

        // Seed partitioning is fixed.
        let mut requested = BTreeMap::new();
        requested.insert("seed".to_string(), vec!["q".to_string()]);
        let err = resolve_partition_on(&cube, &all, Some(requested)).unwrap_err();
        assert!(matches!(err, CubeError::InvalidPartitionOn { .. }));

        // Dimensions can never partition.
        let mut requested = BTreeMap::new();
        requested.insert("enrich".to_string(), vec!["x".to_string()]);
        let err = resolve_partition_on(&cube, &all, Some(requested)).unwrap_err();
        assert!(matches!(err, CubeError::InvalidPartitionOn { .. }));

        // Overrides for unknown datasets are rejected.
        let mut requested = BTreeMap::new();
        requested.insert("nope".to_string(), vec!["p".to_string()]);
        let err = resolve_partition_on(&cube, &all, Some(requested)).unwrap_err();
        assert!(matches!(err, CubeError::UnknownDataset(_)));

        let resolved = resolve_partition_on(&cube, &all, None)?;
        assert_eq!(resolved["seed"], vec!["p".to_string()]);
        assert_eq!(resolved["enrich"], vec!["p".to_string()]);
        Ok(())
    }

    #[test]
    fn prebuild_decision_table() {
        let cube = cube();
        let empty = BTreeMap::new();

        // Seed is required before anything is written.
        let err = check_prebuild(&cube, &names(&["enrich"]), &empty, false).unwrap_err();
        assert!(matches!(err, CubeError::MissingSeed(_)));

        assert!(check_prebuild(&cube, &names(&["seed"]), &empty, false).is_ok());
    }
}
