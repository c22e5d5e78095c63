use serde::{Deserialize, Serialize};

use crate::error::{CubeError, Result};

/// Separator between the cube prefix and the dataset name inside a dataset
/// uuid. Reserved: it must not appear in prefixes or dataset names.
pub const UUID_SEPARATOR: &str = "++";

/// Immutable cube specification.
///
/// A cube is a set of independently stored datasets sharing the dimension
/// columns. The specification is never persisted as its own entity; it is
/// embedded into every dataset manifest and reconstructable on discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    pub uuid_prefix: String,
    pub dimension_columns: Vec<String>,
    pub partition_columns: Vec<String>,
    pub seed_dataset: String,
    pub index_columns: Vec<String>,
    pub suppress_index_on: Vec<String>,
}

impl Cube {
    pub fn new(
        uuid_prefix: impl Into<String>,
        dimension_columns: Vec<String>,
        partition_columns: Vec<String>,
        seed_dataset: impl Into<String>,
    ) -> Result<Self> {
        let cube = Self {
            uuid_prefix: uuid_prefix.into(),
            dimension_columns,
            partition_columns,
            seed_dataset: seed_dataset.into(),
            index_columns: Vec::new(),
            suppress_index_on: Vec::new(),
        };
        cube.validate()?;
        Ok(cube)
    }

    pub fn with_index_columns(mut self, index_columns: Vec<String>) -> Result<Self> {
        self.index_columns = index_columns;
        self.validate()?;
        Ok(self)
    }

    pub fn with_suppress_index_on(mut self, suppress_index_on: Vec<String>) -> Result<Self> {
        self.suppress_index_on = suppress_index_on;
        self.validate()?;
        Ok(self)
    }

    /// Storage uuid of one dataset: `<prefix>++<name>`.
    pub fn dataset_uuid(&self, dataset: &str) -> String {
        format!("{}{}{}", self.uuid_prefix, UUID_SEPARATOR, dataset)
    }

    pub fn is_seed(&self, dataset: &str) -> bool {
        self.seed_dataset == dataset
    }

    fn validate(&self) -> Result<()> {
        check_name(&self.uuid_prefix, "cube prefix")?;
        check_name(&self.seed_dataset, "seed dataset name")?;
        if self.dimension_columns.is_empty() {
            return Err(CubeError::InvalidCube(
                "at least one dimension column is required".to_string(),
            ));
        }
        for col in &self.partition_columns {
            if self.dimension_columns.contains(col) {
                return Err(CubeError::InvalidCube(format!(
                    "column '{col}' cannot be both a dimension and a partition column"
                )));
            }
        }
        for col in &self.index_columns {
            if self.suppress_index_on.contains(col) {
                return Err(CubeError::InvalidCube(format!(
                    "column '{col}' is both indexed and index-suppressed"
                )));
            }
        }
        Ok(())
    }
}

/// Validate a user-supplied cube prefix or dataset name. The uuid separator
/// and the blob key separator are reserved.
pub(crate) fn check_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CubeError::InvalidCube(format!("{what} must not be empty")));
    }
    if name.contains(UUID_SEPARATOR) {
        return Err(CubeError::InvalidCube(format!(
            "{what} '{name}' contains the reserved separator '{UUID_SEPARATOR}'"
        )));
    }
    if name.contains('/') {
        return Err(CubeError::InvalidCube(format!(
            "{what} '{name}' contains '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dataset_uuid_convention() -> anyhow::Result<()> {
        let cube = Cube::new("my_cube", columns(&["x"]), columns(&["p"]), "seed")?;
        assert_eq!(cube.dataset_uuid("seed"), "my_cube++seed");
        assert_eq!(cube.dataset_uuid("enrich"), "my_cube++enrich");
        assert!(cube.is_seed("seed"));
        assert!(!cube.is_seed("enrich"));
        Ok(())
    }

    #[test]
    fn rejects_reserved_separator() {
        let err = Cube::new("my++cube", columns(&["x"]), vec![], "seed").unwrap_err();
        assert!(matches!(err, CubeError::InvalidCube(_)));

        let err = Cube::new("cube", columns(&["x"]), vec![], "se/ed").unwrap_err();
        assert!(matches!(err, CubeError::InvalidCube(_)));
    }

    #[test]
    fn rejects_empty_dimensions_and_overlap() {
        let err = Cube::new("cube", vec![], vec![], "seed").unwrap_err();
        assert!(matches!(err, CubeError::InvalidCube(_)));

        let err = Cube::new("cube", columns(&["x"]), columns(&["x"]), "seed").unwrap_err();
        assert!(matches!(err, CubeError::InvalidCube(_)));
    }

    #[test]
    fn rejects_suppressed_index_columns() -> anyhow::Result<()> {
        let cube = Cube::new("cube", columns(&["x"]), columns(&["p"]), "seed")?
            .with_index_columns(columns(&["v"]))?;
        let err = cube.with_suppress_index_on(columns(&["v"])).unwrap_err();
        assert!(matches!(err, CubeError::InvalidCube(_)));
        Ok(())
    }
}
