//! `exasol_connection`: named connection definitions used by IMPORT/EXPORT.

use super::{Resource, ResourceKind, SqlContext, parse_name_id, require, same_name};
use crate::db::connection::{cell, opt_cell};
use crate::db::sql::{normalize_name, quote_ident, quote_literal};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSpec {
    pub name: String,
    /// Target address, e.g. `ftp://192.168.1.1/` or a JDBC URL.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Never read back from the database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectionSpec {
    /// `TO '..' [USER '..'] [IDENTIFIED BY '..']`
    fn target_clause(&self) -> String {
        let mut clause = format!("TO {}", quote_literal(&self.to));
        if let Some(user) = &self.username {
            clause.push_str(&format!(" USER {}", quote_literal(user)));
        }
        if let Some(password) = &self.password {
            clause.push_str(&format!(" IDENTIFIED BY {}", quote_literal(password)));
        }
        clause
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE CONNECTION {} {}",
            quote_ident(&self.name),
            self.target_clause()
        )
    }

    pub fn update_sql(prior: &Self, planned: &Self) -> Vec<String> {
        let mut statements = Vec::new();
        if !same_name(&prior.name, &planned.name) {
            statements.push(format!(
                "RENAME CONNECTION {} TO {}",
                quote_ident(&prior.name),
                quote_ident(&planned.name)
            ));
        }
        if prior.to != planned.to
            || prior.username != planned.username
            || prior.password != planned.password
        {
            statements.push(format!(
                "ALTER CONNECTION {} {}",
                quote_ident(&planned.name),
                planned.target_clause()
            ));
        }
        statements
    }
}

#[async_trait]
impl Resource for ConnectionSpec {
    const KIND: ResourceKind = ResourceKind::Connection;
    const GLOBAL: bool = true;

    fn validate(&self) -> ProviderResult<()> {
        require("name", &self.name)?;
        require("to", &self.to)?;
        if self.password.is_some() && self.username.is_none() {
            return Err(ProviderError::invalid_argument(
                "'password' requires 'username'",
            ));
        }
        Ok(())
    }

    fn id(&self) -> String {
        normalize_name(&self.name)
    }

    async fn create(&self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&[self.create_sql()], Self::GLOBAL).await?;
        Self::read(&self.id(), Some(self), ctx).await
    }

    async fn read(id: &str, prior: Option<&Self>, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        let name = parse_name_id(id)?;
        let rows = ctx
            .fetch(
                "SELECT CONNECTION_NAME, CONNECTION_STRING, USER_NAME \
                 FROM EXA_DBA_CONNECTIONS WHERE CONNECTION_NAME = ?",
                &[name.clone()],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ProviderError::not_found(Self::KIND.label(), &name))?;

        Ok(Self {
            name: prior
                .filter(|p| same_name(&p.name, &cell(row, 0)))
                .map(|p| p.name.clone())
                .unwrap_or_else(|| cell(row, 0)),
            to: cell(row, 1),
            username: opt_cell(row, 2),
            password: prior.and_then(|p| p.password.clone()),
        })
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&Self::update_sql(prior, planned), Self::GLOBAL)
            .await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(
            &[format!("DROP CONNECTION {}", quote_ident(&self.name))],
            Self::GLOBAL,
        )
        .await
    }
}
