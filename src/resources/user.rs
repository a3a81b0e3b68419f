//! `exasol_user`
//!
//! A user authenticates either with a password or against LDAP, never both. The
//! password is never returned by the catalog, so state keeps whatever was configured.

use super::{Resource, ResourceKind, SqlContext, parse_name_id, require, same_name};
use crate::db::connection::{cell, opt_cell};
use crate::db::sql::{normalize_name, quote_ident, quote_literal, quote_password};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Distinguished name for LDAP authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_dn: Option<String>,
}

impl UserSpec {
    fn identified_clause(&self) -> String {
        match (&self.password, &self.ldap_dn) {
            (_, Some(dn)) => format!("IDENTIFIED AT LDAP AS {}", quote_literal(dn)),
            (Some(password), None) => format!("IDENTIFIED BY {}", quote_password(password)),
            (None, None) => String::new(),
        }
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE USER {} {}",
            quote_ident(&self.name),
            self.identified_clause()
        )
    }

    pub fn update_sql(prior: &Self, planned: &Self) -> Vec<String> {
        let mut statements = Vec::new();
        if !same_name(&prior.name, &planned.name) {
            statements.push(format!(
                "RENAME USER {} TO {}",
                quote_ident(&prior.name),
                quote_ident(&planned.name)
            ));
        }
        if prior.password != planned.password || prior.ldap_dn != planned.ldap_dn {
            statements.push(format!(
                "ALTER USER {} {}",
                quote_ident(&planned.name),
                planned.identified_clause()
            ));
        }
        statements
    }
}

#[async_trait]
impl Resource for UserSpec {
    const KIND: ResourceKind = ResourceKind::User;
    const GLOBAL: bool = true;

    fn validate(&self) -> ProviderResult<()> {
        require("name", &self.name)?;
        match (&self.password, &self.ldap_dn) {
            (Some(_), Some(_)) => Err(ProviderError::invalid_argument(
                "'password' and 'ldap_dn' are mutually exclusive",
            )),
            (None, None) => Err(ProviderError::invalid_argument(
                "One of 'password' or 'ldap_dn' is required",
            )),
            (Some(password), None) => require("password", password),
            (None, Some(dn)) => require("ldap_dn", dn),
        }
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
                "SELECT USER_NAME, DISTINGUISHED_NAME FROM EXA_DBA_USERS WHERE USER_NAME = ?",
                &[name.clone()],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ProviderError::not_found(Self::KIND.label(), &name))?;

        let actual = cell(row, 0);
        let ldap_dn = opt_cell(row, 1);
        Ok(Self {
            name: prior
                .filter(|p| same_name(&p.name, &actual))
                .map(|p| p.name.clone())
                .unwrap_or(actual),
            // A password only makes sense for users not bound to LDAP
            password: if ldap_dn.is_none() {
                prior.and_then(|p| p.password.clone())
            } else {
                None
            },
            ldap_dn,
        })
    }

    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        ctx.apply(&Self::update_sql(prior, planned), Self::GLOBAL)
            .await?;
        Self::read(&planned.id(), Some(planned), ctx).await
    }

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()> {
        ctx.apply(
            &[format!("DROP USER {} CASCADE", quote_ident(&self.name))],
            Self::GLOBAL,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_user() -> UserSpec {
        UserSpec {
            name: "etl".to_string(),
            password: Some("S3cr\"et".to_string()),
            ldap_dn: None,
        }
    }

    #[test]
    fn test_create_with_password() {
        assert_eq!(
            password_user().create_sql(),
            "CREATE USER \"ETL\" IDENTIFIED BY \"S3cr\"\"et\""
        );
    }

    #[test]
    fn test_create_with_ldap() {
        let user = UserSpec {
            name: "alice".to_string(),
            password: None,
            ldap_dn: Some("cn=alice,dc=example,dc=com".to_string()),
        };
        assert_eq!(
            user.create_sql(),
            "CREATE USER \"ALICE\" IDENTIFIED AT LDAP AS 'cn=alice,dc=example,dc=com'"
        );
    }

    #[test]
    fn test_validate_exclusive_auth() {
        assert!(password_user().validate().is_ok());

        let mut both = password_user();
        both.ldap_dn = Some("cn=etl".to_string());
        assert!(both.validate().is_err());

        let mut neither = password_user();
        neither.password = None;
        assert!(neither.validate().is_err());
    }

    #[test]
    fn test_password_change() {
        let prior = password_user();
        let mut planned = password_user();
        planned.password = Some("rotated".to_string());
        assert_eq!(
            UserSpec::update_sql(&prior, &planned),
            vec!["ALTER USER \"ETL\" IDENTIFIED BY \"rotated\"".to_string()]
        );
    }
}
