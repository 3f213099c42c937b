//! Command line configuration for the guard admin tool.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GUARD_DATABASE_URL` | guard.db | SQLite database path |
//! | `GUARD_CONFIG` | | Guard configuration file (JSON) |
//! | `GUARD_LOG_LEVEL` | info | Log level |
//! | `GUARD_ACTOR` | guard-admin | Actor recorded in audit entries |

use clap::{Args, Parser, Subcommand};

/// Operator tool for the tenant guard.
#[derive(Debug, Clone, Parser)]
#[command(name = "guard-admin")]
#[command(about = "Tenant guard administration: schema, tenants, memberships, audit and compliance")]
pub struct AdminConfig {
    /// SQLite database path, or `:memory:`.
    #[arg(long, env = "GUARD_DATABASE_URL", default_value = "guard.db")]
    pub database: String,

    /// Guard configuration file.
    #[arg(long, env = "GUARD_CONFIG")]
    pub config: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "GUARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Actor recorded in audit entries for provisioning changes.
    #[arg(long, env = "GUARD_ACTOR", default_value = "guard-admin")]
    pub actor: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create or migrate the database schema.
    Init,

    /// Tenant provisioning.
    #[command(subcommand)]
    Tenant(TenantCommand),

    /// Grant a user a role in a tenant.
    Grant(GrantArgs),

    /// Revoke a user's membership in a tenant.
    Revoke {
        user: String,
        tenant: String,
    },

    /// Show whether a user may perform an operation in a tenant.
    Authorize {
        user: String,
        tenant: String,
        operation: String,
    },

    /// Deliver every queued audit entry to the audit log.
    FlushAudit,

    /// Summarize the audit log over the last `--hours`.
    Summarize {
        /// Restrict the report to one tenant.
        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// List the audit entries of one record.
    History {
        tenant: String,
        table: String,
        record_id: String,

        #[arg(long, default_value = "720")]
        hours: i64,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum TenantCommand {
    /// Create a tenant.
    Create {
        id: String,
        name: String,

        #[arg(long)]
        specialty: Option<String>,

        /// free, starter, professional or enterprise.
        #[arg(long, default_value = "free")]
        tier: String,

        #[arg(long)]
        max_users: Option<u32>,
    },

    /// Deactivate a tenant.
    Deactivate { id: String },
}

#[derive(Debug, Clone, Args)]
pub struct GrantArgs {
    pub user: String,
    pub tenant: String,

    /// patient, staff, practice_manager, tenant_admin or platform_admin.
    pub role: String,

    /// Permission override as `operation=true|false`. Repeatable.
    #[arg(long = "permission", value_parser = parse_permission)]
    pub permissions: Vec<(String, bool)>,
}

fn parse_permission(value: &str) -> Result<(String, bool), String> {
    let (operation, allowed) = value
        .split_once('=')
        .ok_or_else(|| format!("expected operation=true|false, got '{}'", value))?;
    let allowed = allowed
        .parse::<bool>()
        .map_err(|_| format!("'{}' is not true or false", allowed))?;
    if operation.is_empty() {
        return Err("operation name is empty".to_string());
    }
    Ok((operation.to_string(), allowed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdminConfig::try_parse_from(["guard-admin", "init"]).unwrap();
        assert_eq!(config.database, "guard.db");
        assert_eq!(config.log_level, "info");
        assert!(matches!(config.command, Command::Init));
    }

    #[test]
    fn test_grant_with_permissions() {
        let config = AdminConfig::try_parse_from([
            "guard-admin",
            "--database",
            ":memory:",
            "grant",
            "alice",
            "clinic-a",
            "staff",
            "--permission",
            "manageBilling=true",
            "--permission",
            "viewPatientRecord=false",
        ])
        .unwrap();

        match config.command {
            Command::Grant(args) => {
                assert_eq!(args.role, "staff");
                assert_eq!(
                    args.permissions,
                    vec![
                        ("manageBilling".to_string(), true),
                        ("viewPatientRecord".to_string(), false)
                    ]
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_bad_permission_is_rejected() {
        let result = AdminConfig::try_parse_from([
            "guard-admin",
            "grant",
            "alice",
            "clinic-a",
            "staff",
            "--permission",
            "manageBilling",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_summarize_tenant() {
        let config =
            AdminConfig::try_parse_from(["guard-admin", "summarize", "--tenant", "clinic-a"])
                .unwrap();
        match config.command {
            Command::Summarize { tenant, hours } => {
                assert_eq!(tenant.as_deref(), Some("clinic-a"));
                assert_eq!(hours, 24);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
