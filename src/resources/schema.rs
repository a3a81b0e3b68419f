//! `exasol_physical_schema`

use super::{Resource, ResourceKind, SqlContext, parse_name_id, require, same_name};
use crate::db::connection::{cell, opt_cell};
use crate::db::sql::{normalize_name, quote_ident};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaSpec {
    pub name: String,
    /// User or role owning the schema. Defaults to the creating user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl SchemaSpec {
    pub fn create_sql(&self) -> Vec<String> {
        let mut statements = vec![format!("CREATE SCHEMA {}", quote_ident(&self.name))];
        if let Some(owner) = &self.owner {
            statements.push(change_owner_sql(&self.name, owner));
        }
        statements
    }

    pub fn update_sql(prior: &Self, planned: &Self) -> Vec<String> {
        let mut statements = Vec::new();
        if !same_name(&prior.name, &planned.name) {
            statements.push(format!(
                "RENAME SCHEMA {} TO {}",
                quote_ident(&prior.name),
                quote_ident(&planned.name)
            ));
        }
        if let Some(owner) = &planned.owner {
            let changed = prior
                .owner
                .as_deref()
                .is_none_or(|current| !same_name(current, owner));
            if changed {
                statements.push(change_owner_sql(&planned.name, owner));
            }
        }
        statements
    }
}

fn change_owner_sql(schema: &str, owner: &str) -> String {
    format!(
        "ALTER SCHEMA {} CHANGE OWNER {}",
        quote_ident(schema),
        quote_ident(owner)
    )
}

#[async_trait]
impl Resource for SchemaSpec {
    const KIND: ResourceKind = ResourceKind::PhysicalSchema;

    fn validate(&self) -> ProviderResult<()> {
        require("name", &self.name)?;
        if let Some(owner) = &self.owner {
            require("owner", owner)?;
        }
        Ok(())
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
                "SELECT SCHEMA_NAME, SCHEMA_OWNER FROM EXA_SCHEMAS \
                 WHERE SCHEMA_NAME = ? AND SCHEMA_IS_VIRTUAL = FALSE",
                &[name.clone()],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ProviderError::not_found(Self::KIND.label(), &name))?;

        // Keep the configured spelling when it folds to the same name
        let keep = |configured: Option<&String>, actual: Option<String>| match (configured, actual)
        {
            (Some(c), Some(a)) if same_name(c, &a) => Some(c.clone()),
            (_, actual) => actual,
        };

        Ok(Self {
            name: keep(prior.map(|p| &p.name), Some(cell(row, 0))).unwrap_or_default(),
            owner: keep(prior.and_then(|p| p.owner.as_ref()), opt_cell(row, 1)),
        })
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&Self::update_sql(prior, planned), Self::GLOBAL)
            .await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(
            &[format!("DROP SCHEMA {} CASCADE", quote_ident(&self.name))],
            Self::GLOBAL,
        )
        .await
    }
}
