use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;
use rayon::prelude::*;

use crate::codec::Codec;
use crate::conditions::Conjunction;
use crate::cube::Cube;
use crate::dataset::{discover_datasets, DatasetMetadata, Partition};
use crate::error::{CubeError, Result};
use crate::storage::BlobStore;

/// What to read from a cube. Defaults: auto-discovered datasets, the cube's
/// dimension columns, no grouping, all payload columns.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub conditions: Option<Conjunction>,
    pub datasets: Option<Vec<String>>,
    pub dimension_columns: Option<Vec<String>>,
    pub partition_by: Option<Vec<String>>,
    pub payload_columns: Option<Vec<String>>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conditions(mut self, conditions: impl Into<Conjunction>) -> Self {
        self.conditions = Some(conditions.into());
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

    pub fn with_dimension_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimension_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_partition_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_by = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_payload_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Per-dataset slice of the plan: which columns to read and which clauses
/// apply (a clause applies only when its column exists in the schema).
#[derive(Debug)]
pub(crate) struct DatasetPlan {
    pub columns: Vec<String>,
    pub conditions: Conjunction,
}

/// One retrieval unit: the physical partitions to load per dataset, plus
/// the partition-by key values the group stands for.
#[derive(Debug)]
pub(crate) struct RetrievalGroup {
    pub key: Vec<(String, String)>,
    pub partitions: BTreeMap<String, Vec<Partition>>,
}

#[derive(Debug)]
pub(crate) struct QueryPlan {
    pub datasets: BTreeMap<String, DatasetMetadata>,
    pub dimension_columns: Vec<String>,
    pub partition_by: Vec<String>,
    pub per_dataset: BTreeMap<String, DatasetPlan>,
    pub groups: Vec<RetrievalGroup>,
}

/// Resolve a request into retrieval groups: datasets, effective columns,
/// per-dataset condition subsets, predicate-pruned partitions.
pub(crate) fn plan_query(
    store: &dyn BlobStore,
    cube: &Cube,
    request: &QueryRequest,
) -> Result<QueryPlan> {
    let discovered = discover_datasets(store, cube)?;
    let datasets: BTreeMap<String, DatasetMetadata> = match &request.datasets {
        None => discovered,
        Some(names) => {
            let unknown: Vec<String> = names
                .iter()
                .filter(|n| !discovered.contains_key(*n))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(CubeError::UnknownDataset(unknown));
            }
            discovered
                .into_iter()
                .filter(|(name, _)| names.contains(name))
                .collect()
        }
    };
    if !datasets.contains_key(&cube.seed_dataset) {
        return Err(CubeError::Query(format!(
            "the seed dataset '{}' must be part of every query",
            cube.seed_dataset
        )));
    }

    let dimension_columns = request
        .dimension_columns
        .clone()
        .unwrap_or_else(|| cube.dimension_columns.clone());
    if dimension_columns.is_empty() {
        return Err(CubeError::Query(
            "at least one dimension column is required".to_string(),
        ));
    }
    for column in &dimension_columns {
        if !cube.dimension_columns.contains(column) {
            return Err(CubeError::Query(format!(
                "'{column}' is not a dimension column of the cube"
            )));
        }
    }

    let partition_by = request.partition_by.clone().unwrap_or_default();
    for column in &partition_by {
        if !cube.partition_columns.contains(column) {
            return Err(CubeError::Query(format!(
                "cannot group the result by non-partition column '{column}'"
            )));
        }
    }

    let mut all_columns = BTreeSet::new();
    for ds in datasets.values() {
        all_columns.extend(ds.columns());
    }

    let payload_columns: Vec<String> = match &request.payload_columns {
        Some(requested) => {
            for column in requested {
                if !all_columns.contains(column) {
                    return Err(CubeError::Query(format!(
                        "payload column '{column}' does not exist in any selected dataset"
                    )));
                }
            }
            let mut columns = requested.clone();
            columns.sort();
            columns.dedup();
            columns
        }
        None => all_columns
            .iter()
            .filter(|c| {
                !cube.dimension_columns.contains(*c) && !cube.partition_columns.contains(*c)
            })
            .cloned()
            .collect(),
    };

    let conjunction = request.conditions.clone().unwrap_or_default();
    for column in conjunction.columns() {
        if !all_columns.contains(&column) {
            return Err(CubeError::Query(format!(
                "condition column '{column}' does not exist in any selected dataset"
            )));
        }
    }

    let mut wanted: BTreeSet<String> = dimension_columns.iter().cloned().collect();
    wanted.extend(partition_by.iter().cloned());
    wanted.extend(cube.partition_columns.iter().cloned());
    wanted.extend(payload_columns.iter().cloned());

    let mut per_dataset = BTreeMap::new();
    let mut pruned: BTreeMap<String, Vec<Partition>> = BTreeMap::new();
    for (name, ds) in &datasets {
        let applicable = conjunction.restrict_to(&ds.columns());
        let columns: Vec<String> = ds
            .schema
            .iter()
            .map(|(column, _)| column.clone())
            .filter(|c| wanted.contains(c) || ds.partition_on.contains(c))
            .collect();
        let parts: Vec<Partition> = ds
            .partitions
            .iter()
            .filter(|p| applicable.matches_partition(&p.values))
            .cloned()
            .collect();
        per_dataset.insert(
            name.clone(),
            DatasetPlan {
                columns,
                conditions: applicable,
            },
        );
        pruned.insert(name.clone(), parts);
    }

    let groups = build_groups(&datasets, &partition_by, pruned);

    Ok(QueryPlan {
        datasets,
        dimension_columns,
        partition_by,
        per_dataset,
        groups,
    })
}

fn build_groups(
    datasets: &BTreeMap<String, DatasetMetadata>,
    partition_by: &[String],
    pruned: BTreeMap<String, Vec<Partition>>,
) -> Vec<RetrievalGroup> {
    if partition_by.is_empty() {
        return vec![RetrievalGroup {
            key: Vec::new(),
            partitions: pruned,
        }];
    }

    // Key combinations observed across pruned partitions of datasets whose
    // physical partitioning covers all partition-by columns.
    let mut combos: BTreeSet<Vec<String>> = BTreeSet::new();
    for (name, parts) in &pruned {
        let ds = &datasets[name];
        if !partition_by.iter().all(|c| ds.partition_on.contains(c)) {
            continue;
        }
        for p in parts {
            combos.insert(
                partition_by
                    .iter()
                    .map(|c| p.value_of(c).unwrap_or_default().to_string())
                    .collect(),
            );
        }
    }

    combos
        .into_iter()
        .map(|combo| {
            let mut partitions = BTreeMap::new();
            for (name, parts) in &pruned {
                // Partitions not labeled with a key column stay in every
                // group; the loader filters them row-wise.
                let selected: Vec<Partition> = parts
                    .iter()
                    .filter(|p| {
                        partition_by
                            .iter()
                            .zip(combo.iter())
                            .all(|(column, value)| match p.value_of(column) {
                                Some(label) => label == value,
                                None => true,
                            })
                    })
                    .cloned()
                    .collect();
                partitions.insert(name.clone(), selected);
            }
            RetrievalGroup {
                key: partition_by
                    .iter()
                    .cloned()
                    .zip(combo.into_iter())
                    .collect(),
                partitions,
            }
        })
        .collect()
}

/// Load one group and join all contributing datasets into a single table.
///
/// The seed dataset leads the inner join, so rows whose dimension tuple is
/// absent from the seed are dropped. Partition decodes run in parallel;
/// everything else is sequential.
pub(crate) fn load_group(
    store: &dyn BlobStore,
    codec: &Codec,
    cube: &Cube,
    plan: &QueryPlan,
    group: &RetrievalGroup,
) -> Result<DataFrame> {
    let mut order: Vec<String> = plan.datasets.keys().cloned().collect();
    order.retain(|name| name != &cube.seed_dataset);
    order.insert(0, cube.seed_dataset.clone());

    // Columns eligible as join keys; payload disjointness guarantees any
    // other shared column cannot occur.
    let mut join_candidates: BTreeSet<String> = plan.dimension_columns.iter().cloned().collect();
    join_candidates.extend(cube.partition_columns.iter().cloned());
    for ds in plan.datasets.values() {
        join_candidates.extend(ds.partition_on.iter().cloned());
    }

    let mut joined: Option<LazyFrame> = None;
    let mut joined_columns: BTreeSet<String> = BTreeSet::new();
    for name in &order {
        let ds = &plan.datasets[name];
        let dplan = &plan.per_dataset[name];
        let parts = group
            .partitions
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if parts.is_empty() {
            // Inner join against nothing: the whole group is empty.
            return Ok(DataFrame::empty());
        }

        let frames: Vec<DataFrame> = parts
            .par_iter()
            .map(|p| -> Result<DataFrame> {
                let bytes = store.get(&p.key)?;
                codec.decode(&bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        let lazy: Vec<LazyFrame> = frames.into_iter().map(|df| df.lazy()).collect();
        let mut lf = concat(lazy, UnionArgs::default())?
            .select(dplan.columns.iter().map(|c| col(c)).collect::<Vec<_>>());

        // Applicable predicates plus the group key constraint.
        let mut filter = dplan.conditions.to_expr();
        for (column, label) in &group.key {
            if let Some(dtype) = ds.dtype_of(column) {
                let constraint = label_expr(column, dtype, label)?;
                filter = Some(match filter {
                    Some(f) => f.and(constraint),
                    None => constraint,
                });
            }
        }
        if let Some(mask) = filter {
            lf = lf.filter(mask);
        }

        let right_columns: BTreeSet<String> = dplan.columns.iter().cloned().collect();
        joined = Some(match joined {
            None => {
                joined_columns = right_columns;
                lf
            }
            Some(acc) => {
                let on: Vec<Expr> = join_candidates
                    .iter()
                    .filter(|c| joined_columns.contains(*c) && right_columns.contains(*c))
                    .map(|c| col(c))
                    .collect();
                joined_columns.extend(right_columns);
                acc.join(lf, on.clone(), on, JoinArgs::new(JoinType::Inner))
            }
        });
    }

    let df = match joined {
        Some(lf) => lf.collect()?,
        None => return Ok(DataFrame::empty()),
    };
    if df.height() == 0 {
        return Ok(df);
    }
    order_columns(&df, &plan.dimension_columns, &cube.partition_columns)
}

/// Concatenate non-empty groups into one table when no grouping was asked.
pub(crate) fn quick_concat(
    frames: Vec<DataFrame>,
    dimension_columns: &[String],
    partition_columns: &[String],
) -> Result<DataFrame> {
    let lazy: Vec<LazyFrame> = frames.into_iter().map(|df| df.lazy()).collect();
    let df = concat(lazy, UnionArgs::default())?.collect()?;
    order_columns(&df, dimension_columns, partition_columns)
}

/// Dimension and partition columns first, in the cube's declared order; the
/// rest sorted lexicographically.
fn order_columns(
    df: &DataFrame,
    dimension_columns: &[String],
    partition_columns: &[String],
) -> Result<DataFrame> {
    let present: BTreeSet<&str> = df.get_column_names().into_iter().collect();
    let mut front: Vec<String> = dimension_columns
        .iter()
        .filter(|c| present.contains(c.as_str()))
        .cloned()
        .collect();
    for column in partition_columns {
        if present.contains(column.as_str()) && !front.contains(column) {
            front.push(column.clone());
        }
    }
    let mut rest: Vec<String> = present
        .iter()
        .map(|s| s.to_string())
        .filter(|c| !front.contains(c))
        .collect();
    rest.sort();
    front.extend(rest);
    Ok(df.select(front)?)
}

fn label_expr(column: &str, dtype: &str, label: &str) -> Result<Expr> {
    let parse_err = || CubeError::PartitionValue(format!("'{label}' as {dtype}"));
    let value = match dtype {
        "bool" => lit(label.parse::<bool>().map_err(|_| parse_err())?),
        "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "u64" => {
            lit(label.parse::<i64>().map_err(|_| parse_err())?)
        }
        "f32" | "f64" => lit(label.parse::<f64>().map_err(|_| parse_err())?),
        "str" => lit(label.to_string()),
        _ => return Err(parse_err()),
    };
    Ok(col(column).eq(value))
}
