use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use polars::prelude::*;

/// A concrete comparison value inside a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn to_lit(&self) -> Expr {
        match self {
            Scalar::Bool(v) => lit(*v),
            Scalar::Int(v) => lit(*v),
            Scalar::Float(v) => lit(*v),
            Scalar::Str(v) => lit(v.clone()),
        }
    }

    /// Parse a partition label back into this scalar's type. `None` when the
    /// label does not parse, in which case pruning must keep the partition.
    fn parse_label(&self, label: &str) -> Option<Scalar> {
        match self {
            Scalar::Bool(_) => label.parse().ok().map(Scalar::Bool),
            Scalar::Int(_) => label.parse().ok().map(Scalar::Int),
            Scalar::Float(_) => label.parse().ok().map(Scalar::Float),
            Scalar::Str(_) => Some(Scalar::Str(label.to_string())),
        }
    }

    fn partial_cmp(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn eval(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// One predicate over a single column: a comparison or a set membership.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Cmp {
        column: String,
        op: CmpOp,
        value: Scalar,
    },
    In {
        column: String,
        values: Vec<Scalar>,
    },
}

impl Condition {
    fn cmp(column: impl Into<String>, op: CmpOp, value: impl Into<Scalar>) -> Self {
        Condition::Cmp {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::cmp(column, CmpOp::Ge, value)
    }

    pub fn is_in<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        Condition::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Condition::Cmp { column, .. } => column,
            Condition::In { column, .. } => column,
        }
    }

    /// Row-level polars mask for this condition.
    pub fn to_expr(&self) -> Expr {
        match self {
            Condition::Cmp { column, op, value } => {
                let c = col(column);
                let v = value.to_lit();
                match op {
                    CmpOp::Eq => c.eq(v),
                    CmpOp::Ne => c.neq(v),
                    CmpOp::Lt => c.lt(v),
                    CmpOp::Le => c.lt_eq(v),
                    CmpOp::Gt => c.gt(v),
                    CmpOp::Ge => c.gt_eq(v),
                }
            }
            // Membership as an OR of equalities keeps the expr feature-free.
            Condition::In { column, values } => values
                .iter()
                .map(|v| col(column).eq(v.to_lit()))
                .reduce(|a, b| a.or(b))
                .unwrap_or_else(|| lit(false)),
        }
    }

    /// Evaluate against one partition label value. Labels that cannot be
    /// parsed into the condition's type never prune (the row-level filter
    /// re-checks exactly).
    pub fn matches_label(&self, label: &str) -> bool {
        match self {
            Condition::Cmp { op, value, .. } => match value.parse_label(label) {
                Some(parsed) => match parsed.partial_cmp(value) {
                    Some(ord) => op.eval(ord),
                    None => true,
                },
                None => true,
            },
            Condition::In { values, .. } => values.iter().any(|v| match v.parse_label(label) {
                Some(parsed) => parsed == *v,
                None => true,
            }),
        }
    }
}

/// An AND of conditions; the only combinator the planner needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conjunction {
    conditions: Vec<Condition>,
}

impl Conjunction {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn columns(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .map(|c| c.column().to_string())
            .collect()
    }

    /// True when every referenced column exists in the given schema.
    pub fn applies_to(&self, schema_columns: &BTreeSet<String>) -> bool {
        self.conditions
            .iter()
            .all(|c| schema_columns.contains(c.column()))
    }

    /// The subset of clauses referencing only the given columns.
    pub fn restrict_to(&self, columns: &BTreeSet<String>) -> Conjunction {
        Conjunction {
            conditions: self
                .conditions
                .iter()
                .filter(|c| columns.contains(c.column()))
                .cloned()
                .collect(),
        }
    }

    /// AND-fold into one polars mask; `None` for the empty conjunction.
    pub fn to_expr(&self) -> Option<Expr> {
        self.conditions
            .iter()
            .map(Condition::to_expr)
            .reduce(|a, b| a.and(b))
    }

    /// Evaluate against a partition's labels. Clauses on columns the
    /// partition is not labeled with cannot prune and count as matching.
    pub fn matches_partition(&self, values: &[(String, String)]) -> bool {
        self.conditions.iter().all(|c| {
            match values.iter().find(|(k, _)| k == c.column()) {
                Some((_, label)) => c.matches_label(label),
                None => true,
            }
        })
    }
}

impl From<Condition> for Conjunction {
    fn from(condition: Condition) -> Self {
        Conjunction::new(vec![condition])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use polars::df;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn restrict_and_applies() {
        let conj = Conjunction::new(vec![Condition::eq("p", 1), Condition::gt("v", 10)]);
        assert!(conj.applies_to(&set(&["p", "v", "x"])));
        assert!(!conj.applies_to(&set(&["p", "x"])));

        let restricted = conj.restrict_to(&set(&["p"]));
        assert_eq!(restricted.conditions().len(), 1);
        assert_eq!(restricted.conditions()[0].column(), "p");
        assert_eq!(conj.columns(), set(&["p", "v"]));
    }

    #[test]
    fn label_matching_is_typed() {
        let cond = Condition::eq("p", 1);
        assert!(cond.matches_label("1"));
        assert!(!cond.matches_label("10"));
        // Unparseable labels never prune.
        assert!(cond.matches_label("not-a-number"));

        let cond = Condition::ge("p", 2);
        assert!(!cond.matches_label("1"));
        assert!(cond.matches_label("2"));
        assert!(cond.matches_label("10"));

        let cond = Condition::is_in("q", ["a", "b"]);
        assert!(cond.matches_label("a"));
        assert!(!cond.matches_label("c"));
    }

    #[test]
    fn partition_matching_ignores_unlabeled_columns() {
        let conj = Conjunction::new(vec![Condition::eq("p", 1), Condition::eq("v", 3)]);
        let values = vec![("p".to_string(), "1".to_string())];
        assert!(conj.matches_partition(&values));
        let values = vec![("p".to_string(), "0".to_string())];
        assert!(!conj.matches_partition(&values));
    }

    #[test]
    fn expr_filters_rows() -> Result<()> {
        let df = df!("p" => [0i64, 0, 1, 1], "v" => [10i64, 20, 30, 40])?;
        let conj = Conjunction::new(vec![Condition::eq("p", 1i64), Condition::gt("v", 30i64)]);
        let out = df.lazy().filter(conj.to_expr().unwrap()).collect()?;
        assert_eq!(out.height(), 1);
        assert_eq!(out.column("v")?.get(0)?, AnyValue::Int64(40));
        Ok(())
    }
}
