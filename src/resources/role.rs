//! `exasol_role`

use super::{Resource, ResourceKind, SqlContext, parse_name_id, require, same_name};
use crate::db::connection::{cell, opt_cell};
use crate::db::sql::{normalize_name, quote_ident, quote_literal};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn comment_sql(name: &str, comment: Option<&str>) -> String {
    format!(
        "COMMENT ON ROLE {} IS {}",
        quote_ident(name),
        quote_literal(comment.unwrap_or_default())
    )
}

impl RoleSpec {
    pub fn create_sql(&self) -> Vec<String> {
        let mut statements = vec![format!("CREATE ROLE {}", quote_ident(&self.name))];
        if let Some(comment) = &self.comment {
            statements.push(comment_sql(&self.name, Some(comment)));
        }
        statements
    }

    pub fn update_sql(prior: &Self, planned: &Self) -> Vec<String> {
        let mut statements = Vec::new();
        if !same_name(&prior.name, &planned.name) {
            statements.push(format!(
                "RENAME ROLE {} TO {}",
                quote_ident(&prior.name),
                quote_ident(&planned.name)
            ));
        }
        if prior.comment != planned.comment {
            statements.push(comment_sql(&planned.name, planned.comment.as_deref()));
        }
        statements
    }
}

#[async_trait]
impl Resource for RoleSpec {
    const KIND: ResourceKind = ResourceKind::Role;
    const GLOBAL: bool = true;

    fn validate(&self) -> ProviderResult<()> {
        require("name", &self.name)
    }

    fn id(&self) -> String {
        normalize_name(&self.name)
    }

    async fn create(&self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&self.create_sql(), Self::GLOBAL).await?;
        Self::read(&self.id(), Some(self), ctx).await
    }

    async fn read(id: &str, prior: Option<&Self>, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        let name = parse_name_id(id)?;
        let rows = ctx
            .fetch(
                "SELECT ROLE_NAME, ROLE_COMMENT FROM EXA_DBA_ROLES WHERE ROLE_NAME = ?",
                &[name.clone()],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ProviderError::not_found(Self::KIND.label(), &name))?;

        let actual = cell(row, 0);
        Ok(Self {
            name: prior
                .filter(|p| same_name(&p.name, &actual))
                .map(|p| p.name.clone())
                .unwrap_or(actual),
            comment: opt_cell(row, 1),
        })
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&Self::update_sql(prior, planned), Self::GLOBAL)
            .await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(
            &[format!("DROP ROLE {} CASCADE", quote_ident(&self.name))],
            Self::GLOBAL,
        )
        .await
    }
}
