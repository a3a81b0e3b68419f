//! `exasol_table`
//!
//! Tables are created in one statement with inline constraints and distribution and
//! partition clauses. Updates compare the current catalog state with the planned spec and
//! emit the minimal `ALTER TABLE` sequence; changing the schema requires replacement.

use super::{
    Resource, ResourceKind, SqlContext, parse_qualified_id, qualified_id, require, same_name,
};
use crate::db::connection::{Row, bool_cell, cell, int_cell, opt_cell};
use crate::db::sql::{normalize_name, qualified, quote_ident};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSpec {
    pub name: String,
    /// SQL data type, e.g. `VARCHAR(100)` or `DECIMAL(18,2)`.
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value as a SQL expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ForeignKeySpec {
    /// Constraint name; generated by the database when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub references_schema: String,
    pub references_table: String,
    pub references_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
    #[serde(default)]
    pub distribute_by: Vec<String>,
    #[serde(default)]
    pub partition_by: Vec<String>,
}

/// Canonical spelling of a data type so aliases compare equal.
///
/// The catalog reports `VARCHAR(100) UTF8` for `VARCHAR(100)` and `DECIMAL(18,0)` for
/// `INTEGER`.
pub fn normalize_type(data_type: &str) -> String {
    let upper = data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
        .replace(", ", ",")
        .replace(" (", "(");

    let upper = upper
        .strip_suffix(" UTF8")
        .map(str::to_string)
        .unwrap_or(upper);

    let (base, args) = match upper.split_once('(') {
        Some((base, rest)) => (base.trim().to_string(), Some(format!("({}", rest))),
        None => (upper.clone(), None),
    };

    let base = match base.as_str() {
        "INT" | "INTEGER" => return "DECIMAL(18,0)".to_string(),
        "BIGINT" => return "DECIMAL(36,0)".to_string(),
        "SMALLINT" => return "DECIMAL(9,0)".to_string(),
        "TINYINT" => return "DECIMAL(3,0)".to_string(),
        "BOOL" => return "BOOLEAN".to_string(),
        "FLOAT" | "REAL" | "DOUBLE PRECISION" | "NUMBER" if args.is_none() => {
            return "DOUBLE".to_string();
        }
        "DEC" | "NUMERIC" | "NUMBER" => "DECIMAL".to_string(),
        "VARCHAR2" | "NVARCHAR" | "NVARCHAR2" | "CHARACTER VARYING" => "VARCHAR".to_string(),
        "CHARACTER" | "NCHAR" => "CHAR".to_string(),
        other => other.to_string(),
    };

    match (base.as_str(), args) {
        ("DECIMAL", None) => "DECIMAL(18,0)".to_string(),
        ("DECIMAL", Some(args)) if !args.contains(',') => {
            format!("DECIMAL{},0)", args.trim_end_matches(')'))
        }
        ("CHAR", None) => "CHAR(1)".to_string(),
        (base, Some(args)) => format!("{}{}", base, args),
        (base, None) => base.to_string(),
    }
}

fn same_type(a: &str, b: &str) -> bool {
    normalize_type(a) == normalize_type(b)
}

fn ident_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn same_names(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_name(x, y))
}

impl ColumnSpec {
    /// `"NAME" TYPE [DEFAULT expr] [NOT NULL]`
    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.data_type.trim());
        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    fn same_definition(&self, other: &ColumnSpec) -> bool {
        same_type(&self.data_type, &other.data_type)
            && self.nullable == other.nullable
            && self.default.as_deref().map(str::trim) == other.default.as_deref().map(str::trim)
    }
}

impl ForeignKeySpec {
    /// `[CONSTRAINT "N"] FOREIGN KEY (..) REFERENCES "S"."T" (..)`
    fn clause(&self) -> String {
        let constraint = self
            .name
            .as_ref()
            .map(|n| format!("CONSTRAINT {} ", quote_ident(n)))
            .unwrap_or_default();
        format!(
            "{}FOREIGN KEY ({}) REFERENCES {} ({})",
            constraint,
            ident_list(&self.columns),
            qualified(&self.references_schema, &self.references_table),
            ident_list(&self.references_columns)
        )
    }

    /// Equal ignoring a missing name on either side.
    fn same_target(&self, other: &ForeignKeySpec) -> bool {
        let names_match = match (&self.name, &other.name) {
            (Some(a), Some(b)) => same_name(a, b),
            _ => true,
        };
        names_match
            && same_names(&self.columns, &other.columns)
            && same_name(&self.references_schema, &other.references_schema)
            && same_name(&self.references_table, &other.references_table)
            && same_names(&self.references_columns, &other.references_columns)
    }
}

impl TableSpec {
    fn target(&self) -> String {
        qualified(&self.schema, &self.name)
    }

    pub fn create_sql(&self) -> String {
        let mut elements: Vec<String> = self.columns.iter().map(ColumnSpec::definition).collect();

        if !self.primary_key.is_empty() {
            elements.push(format!("PRIMARY KEY ({})", ident_list(&self.primary_key)));
        }
        elements.extend(self.foreign_keys.iter().map(ForeignKeySpec::clause));
        if !self.distribute_by.is_empty() {
            elements.push(format!("DISTRIBUTE BY {}", ident_list(&self.distribute_by)));
        }
        if !self.partition_by.is_empty() {
            elements.push(format!("PARTITION BY {}", ident_list(&self.partition_by)));
        }

        format!(
            "CREATE TABLE {} ({})",
            self.target(),
            elements.join(", ")
        )
    }

    /// Statements moving `current` to `planned`.
    ///
    /// Constraints are dropped before columns change and added after, so a column can be
    /// removed together with the key that referenced it.
    pub fn update_sql(current: &Self, planned: &Self) -> ProviderResult<Vec<String>> {
        if !same_name(&current.schema, &planned.schema) {
            return Err(ProviderError::invalid_argument(format!(
                "Moving table '{}' from schema '{}' to '{}' requires replacement",
                current.name, current.schema, planned.schema
            )));
        }

        let mut statements = Vec::new();
        if !same_name(&current.name, &planned.name) {
            statements.push(format!(
                "RENAME TABLE {} TO {}",
                current.target(),
                quote_ident(&planned.name)
            ));
        }
        let target = planned.target();
        let alter = |clause: String| format!("ALTER TABLE {} {}", target, clause);

        let primary_key_changed = !same_names(&current.primary_key, &planned.primary_key);
        if primary_key_changed && !current.primary_key.is_empty() {
            statements.push(alter("DROP PRIMARY KEY".to_string()));
        }

        for fk in &current.foreign_keys {
            if planned.foreign_keys.iter().any(|p| p.same_target(fk)) {
                continue;
            }
            let name = fk.name.as_ref().ok_or_else(|| {
                ProviderError::internal("Foreign key read from the catalog has no name")
            })?;
            statements.push(alter(format!("DROP CONSTRAINT {}", quote_ident(name))));
        }

        for column in &current.columns {
            if !planned.columns.iter().any(|c| same_name(&c.name, &column.name)) {
                statements.push(alter(format!("DROP COLUMN {}", quote_ident(&column.name))));
            }
        }

        for column in &planned.columns {
            match current.columns.iter().find(|c| same_name(&c.name, &column.name)) {
                None => statements.push(alter(format!("ADD COLUMN {}", column.definition()))),
                Some(existing) if !existing.same_definition(column) => {
                    if existing.default.is_some() && column.default.is_none() {
                        statements.push(alter(format!(
                            "ALTER COLUMN {} DROP DEFAULT",
                            quote_ident(&column.name)
                        )));
                    }
                    let mut modify =
                        format!("MODIFY COLUMN {} {}", quote_ident(&column.name), column.data_type.trim());
                    if let Some(default) = &column.default {
                        modify.push_str(&format!(" DEFAULT {}", default));
                    }
                    modify.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
                    statements.push(alter(modify));
                }
                Some(_) => {}
            }
        }

        if primary_key_changed && !planned.primary_key.is_empty() {
            statements.push(alter(format!(
                "ADD PRIMARY KEY ({})",
                ident_list(&planned.primary_key)
            )));
        }

        for fk in &planned.foreign_keys {
            if !current.foreign_keys.iter().any(|c| c.same_target(fk)) {
                statements.push(alter(format!("ADD {}", fk.clause())));
            }
        }

        if !same_names(&current.distribute_by, &planned.distribute_by) {
            statements.push(if planned.distribute_by.is_empty() {
                alter("DROP DISTRIBUTION KEYS".to_string())
            } else {
                alter(format!("DISTRIBUTE BY {}", ident_list(&planned.distribute_by)))
            });
        }
        if !same_names(&current.partition_by, &planned.partition_by) {
            statements.push(if planned.partition_by.is_empty() {
                alter("DROP PARTITION KEYS".to_string())
            } else {
                alter(format!("PARTITION BY {}", ident_list(&planned.partition_by)))
            });
        }

        Ok(statements)
    }

    /// Build state from catalog rows, preferring the configured spelling of names and
    /// types wherever they mean the same thing.
    pub fn from_catalog(
        schema: &str,
        name: &str,
        column_rows: &[Row],
        constraint_rows: &[Row],
        prior: Option<&Self>,
    ) -> Self {
        let prior_column =
            |col: &str| prior.and_then(|p| p.columns.iter().find(|c| same_name(&c.name, col)));

        let mut distribute_by = Vec::new();
        let mut partitions: Vec<(i64, String)> = Vec::new();
        let columns = column_rows
            .iter()
            .map(|row| {
                let column_name = cell(row, 0);
                let data_type = cell(row, 1);
                let default = opt_cell(row, 3);
                if bool_cell(row, 4) {
                    distribute_by.push(column_name.clone());
                }
                if let Some(position) = int_cell(row, 5) {
                    partitions.push((position, column_name.clone()));
                }
                let configured = prior_column(&column_name);
                ColumnSpec {
                    name: configured
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| column_name.clone()),
                    data_type: configured
                        .filter(|c| same_type(&c.data_type, &data_type))
                        .map(|c| c.data_type.clone())
                        .unwrap_or(data_type),
                    nullable: bool_cell(row, 2),
                    default: match configured.and_then(|c| c.default.clone()) {
                        Some(d) if default.as_deref().map(str::trim) == Some(d.trim()) => Some(d),
                        _ => default,
                    },
                }
            })
            .collect();
        partitions.sort_by_key(|(position, _)| *position);

        let mut primary_key = Vec::new();
        let mut foreign_keys: BTreeMap<String, ForeignKeySpec> = BTreeMap::new();
        for row in constraint_rows {
            let constraint_name = cell(row, 1);
            match cell(row, 0).as_str() {
                "PRIMARY KEY" => primary_key.push(cell(row, 2)),
                "FOREIGN KEY" => {
                    let fk = foreign_keys
                        .entry(constraint_name.clone())
                        .or_insert_with(|| ForeignKeySpec {
                            name: Some(constraint_name),
                            columns: Vec::new(),
                            references_schema: cell(row, 3),
                            references_table: cell(row, 4),
                            references_columns: Vec::new(),
                        });
                    fk.columns.push(cell(row, 2));
                    fk.references_columns.push(cell(row, 5));
                }
                _ => {}
            }
        }

        let prefer = |configured: Option<&Vec<String>>, actual: Vec<String>| match configured {
            Some(c) if same_names(c, &actual) => c.clone(),
            _ => actual,
        };

        Self {
            schema: prior
                .filter(|p| same_name(&p.schema, schema))
                .map(|p| p.schema.clone())
                .unwrap_or_else(|| schema.to_string()),
            name: prior
                .filter(|p| same_name(&p.name, name))
                .map(|p| p.name.clone())
                .unwrap_or_else(|| name.to_string()),
            columns,
            primary_key: prefer(prior.map(|p| &p.primary_key), primary_key),
            // A configured key without a name stays unnamed rather than taking the generated one
            foreign_keys: foreign_keys
                .into_values()
                .map(|actual| {
                    prior
                        .and_then(|p| p.foreign_keys.iter().find(|c| c.same_target(&actual)))
                        .cloned()
                        .unwrap_or(actual)
                })
                .collect(),
            distribute_by: prefer(prior.map(|p| &p.distribute_by), distribute_by),
            partition_by: prefer(
                prior.map(|p| &p.partition_by),
                partitions.into_iter().map(|(_, c)| c).collect(),
            ),
        }
    }
}

const COLUMNS_SQL: &str = "SELECT COLUMN_NAME, COLUMN_TYPE, \
     CAST(COLUMN_IS_NULLABLE AS VARCHAR(5)), COLUMN_DEFAULT, \
     CAST(COLUMN_IS_DISTRIBUTION_KEY AS VARCHAR(5)), \
     CAST(COLUMN_PARTITION_KEY_ORDINAL_POSITION AS VARCHAR(10)) \
     FROM EXA_ALL_COLUMNS \
     WHERE COLUMN_SCHEMA = ? AND COLUMN_TABLE = ? AND COLUMN_OBJECT_TYPE = 'TABLE' \
     ORDER BY COLUMN_ORDINAL_POSITION";

const CONSTRAINTS_SQL: &str = "SELECT CONSTRAINT_TYPE, CONSTRAINT_NAME, COLUMN_NAME, \
     REFERENCED_SCHEMA, REFERENCED_TABLE, REFERENCED_COLUMN \
     FROM EXA_ALL_CONSTRAINT_COLUMNS \
     WHERE CONSTRAINT_SCHEMA = ? AND CONSTRAINT_TABLE = ? \
     ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION";

#[async_trait]
impl Resource for TableSpec {
    const KIND: ResourceKind = ResourceKind::Table;

    fn validate(&self) -> ProviderResult<()> {
        require("schema", &self.schema)?;
        require("name", &self.name)?;
        if self.columns.is_empty() {
            return Err(ProviderError::invalid_argument(
                "A table needs at least one column",
            ));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            require("columns.name", &column.name)?;
            require("columns.type", &column.data_type)?;
            if !seen.insert(normalize_name(&column.name)) {
                return Err(ProviderError::invalid_argument(format!(
                    "Duplicate column '{}'",
                    column.name
                )));
            }
        }

        let check = |field: &str, names: &[String]| -> ProviderResult<()> {
            for name in names {
                if !seen.contains(&normalize_name(name)) {
                    return Err(ProviderError::invalid_argument(format!(
                        "'{}' refers to unknown column '{}'",
                        field, name
                    )));
                }
            }
            Ok(())
        };
        check("primary_key", &self.primary_key)?;
        check("distribute_by", &self.distribute_by)?;
        check("partition_by", &self.partition_by)?;
        for fk in &self.foreign_keys {
            check("foreign_keys.columns", &fk.columns)?;
            require("foreign_keys.references_schema", &fk.references_schema)?;
            require("foreign_keys.references_table", &fk.references_table)?;
            if fk.columns.is_empty() || fk.columns.len() != fk.references_columns.len() {
                return Err(ProviderError::invalid_argument(
                    "'foreign_keys.columns' and 'references_columns' must be non-empty and of equal length",
                ));
            }
        }
        Ok(())
    }

    fn id(&self) -> String {
        qualified_id(&self.schema, &self.name)
    }

    async fn create(&self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&[self.create_sql()], Self::GLOBAL).await?;
        Self::read(&self.id(), Some(self), ctx).await
    }

    async fn read(id: &str, prior: Option<&Self>, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        let (schema, name) = parse_qualified_id(id)?;
        let args = [schema.clone(), name.clone()];

        // Both catalog reads on one session so they see the same snapshot
        let mut lease = ctx.pool.lock().await?;
        let column_rows = lease.fetch(COLUMNS_SQL, &args).await;
        let constraint_rows = match &column_rows {
            Ok(rows) if !rows.is_empty() => lease.fetch(CONSTRAINTS_SQL, &args).await,
            _ => Ok(Vec::new()),
        };
        lease.unlock();

        let column_rows = column_rows?;
        if column_rows.is_empty() {
            return Err(ProviderError::not_found(Self::KIND.label(), id));
        }
        Ok(Self::from_catalog(
            &schema,
            &name,
            &column_rows,
            &constraint_rows?,
            prior,
        ))
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        // Dropping a foreign key needs the name the database gave it
        let reference = Self {
            foreign_keys: Vec::new(),
            ..prior.clone()
        };
        let current = Self::read(&prior.id(), Some(&reference), ctx).await?;
        let statements = Self::update_sql(&current, planned)?;
        ctx.apply(&statements, Self::GLOBAL).await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(
            &[format!("DROP TABLE {} CASCADE CONSTRAINTS", self.target())],
            Self::GLOBAL,
        )
        .await
    }
}
