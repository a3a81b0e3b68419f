//! `exasol_view`

use super::{
    Resource, ResourceKind, SqlContext, parse_qualified_id, qualified_id, require, same_name,
};
use crate::db::connection::{cell, opt_cell};
use crate::db::sql::{qualified, quote_ident, quote_literal};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ViewColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ViewSpec {
    pub schema: String,
    pub name: String,
    /// The `SELECT` the view is defined by.
    pub subquery: String,
    /// Explicit column names; derived from the subquery when empty.
    #[serde(default)]
    pub columns: Vec<ViewColumn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ViewSpec {
    fn target(&self) -> String {
        qualified(&self.schema, &self.name)
    }

    pub fn create_sql(&self) -> String {
        let mut sql = format!("CREATE OR REPLACE VIEW {}", self.target());
        if !self.columns.is_empty() {
            let columns = self
                .columns
                .iter()
                .map(|c| match &c.comment {
                    Some(comment) => {
                        format!("{} COMMENT IS {}", quote_ident(&c.name), quote_literal(comment))
                    }
                    None => quote_ident(&c.name),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ({})", columns));
        }
        sql.push_str(&format!(" AS {}", self.subquery.trim().trim_end_matches(';')));
        if let Some(comment) = &self.comment {
            sql.push_str(&format!(" COMMENT IS {}", quote_literal(comment)));
        }
        sql
    }

    pub fn update_sql(prior: &Self, planned: &Self) -> ProviderResult<Vec<String>> {
        if !same_name(&prior.schema, &planned.schema) {
            return Err(ProviderError::invalid_argument(format!(
                "Moving view '{}' from schema '{}' to '{}' requires replacement",
                prior.name, prior.schema, planned.schema
            )));
        }
        let mut statements = Vec::new();
        if !same_name(&prior.name, &planned.name) {
            statements.push(format!(
                "RENAME VIEW {} TO {}",
                prior.target(),
                quote_ident(&planned.name)
            ));
        }
        statements.push(planned.create_sql());
        Ok(statements)
    }
}

/// Byte ranges of words outside quotes, parentheses and comments.
fn top_level_words(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                if depth == 0 {
                    words.push((start, i));
                }
            }
            _ => i += 1,
        }
    }
    words
}

/// Recover the subquery from the stored `CREATE VIEW` text.
///
/// Everything after the first top-level `AS` following `VIEW` is the subquery, minus a
/// trailing `COMMENT IS '..'` and statement terminator.
pub fn extract_subquery(view_text: &str) -> Option<String> {
    let words = top_level_words(view_text);
    let word = |(start, end): (usize, usize)| &view_text[start..end];

    let view_at = words.iter().position(|w| word(*w).eq_ignore_ascii_case("VIEW"))?;
    let as_at = words[view_at..]
        .iter()
        .position(|w| word(*w).eq_ignore_ascii_case("AS"))?
        + view_at;
    let body_start = words[as_at].1;

    let mut body_end = view_text.len();
    for pair in words[as_at + 1..].windows(2) {
        if word(pair[0]).eq_ignore_ascii_case("COMMENT") && word(pair[1]).eq_ignore_ascii_case("IS")
        {
            let rest = view_text[pair[1].1..].trim().trim_end_matches(';').trim_end();
            if is_single_literal(rest) {
                body_end = pair[0].0;
            }
        }
    }

    let body = view_text[body_start..body_end]
        .trim()
        .trim_end_matches(';')
        .trim_end();
    (!body.is_empty()).then(|| body.to_string())
}

/// True when `text` is exactly one single-quoted literal.
fn is_single_literal(text: &str) -> bool {
    let Some(inner) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) else {
        return false;
    };
    // Any quote left inside must be part of a doubled pair
    inner.replace("''", "").find('\'').is_none()
}

fn same_sql(a: &str, b: &str) -> bool {
    let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    squash(a.trim().trim_end_matches(';')) == squash(b.trim().trim_end_matches(';'))
}

#[async_trait]
impl Resource for ViewSpec {
    const KIND: ResourceKind = ResourceKind::View;

    fn validate(&self) -> ProviderResult<()> {
        require("schema", &self.schema)?;
        require("name", &self.name)?;
        require("subquery", &self.subquery)?;
        for column in &self.columns {
            require("columns.name", &column.name)?;
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

        let rows = ctx
            .fetch(
                "SELECT VIEW_TEXT, VIEW_COMMENT FROM EXA_ALL_VIEWS \
                 WHERE VIEW_SCHEMA = ? AND VIEW_NAME = ?",
                &args,
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ProviderError::not_found(Self::KIND.label(), id))?;

        let view_text = cell(row, 0);
        let subquery = extract_subquery(&view_text).ok_or_else(|| {
            ProviderError::internal(format!("Cannot parse definition of view '{}'", id))
        })?;

        // Columns are only tracked when configured, or when importing
        let columns = if prior.is_some_and(|p| p.columns.is_empty()) {
            Vec::new()
        } else {
            ctx.fetch(
                "SELECT COLUMN_NAME, COLUMN_COMMENT FROM EXA_ALL_COLUMNS \
                 WHERE COLUMN_SCHEMA = ? AND COLUMN_TABLE = ? \
                 ORDER BY COLUMN_ORDINAL_POSITION",
                &args,
            )
            .await?
            .iter()
            .map(|row| {
                let actual = cell(row, 0);
                ViewColumn {
                    name: prior
                        .and_then(|p| p.columns.iter().find(|c| same_name(&c.name, &actual)))
                        .map(|c| c.name.clone())
                        .unwrap_or(actual),
                    comment: opt_cell(row, 1),
                }
            })
            .collect()
        };

        Ok(Self {
            schema: prior
                .filter(|p| same_name(&p.schema, &schema))
                .map(|p| p.schema.clone())
                .unwrap_or(schema),
            name: prior
                .filter(|p| same_name(&p.name, &name))
                .map(|p| p.name.clone())
                .unwrap_or(name),
            subquery: prior
                .filter(|p| same_sql(&p.subquery, &subquery))
                .map(|p| p.subquery.clone())
                .unwrap_or(subquery),
            columns,
            comment: opt_cell(row, 1),
        })
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&Self::update_sql(prior, planned)?, Self::GLOBAL)
            .await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(&[format!("DROP VIEW {}", self.target())], Self::GLOBAL)
            .await
    }
}
