//! Operator CLI for the identity registry and storage roots.
//!
//! Settings are read from `ISOLATION_*` variables and the config file; the
//! flags below override the data root and database URL. Without a database
//! URL every invocation starts from an empty in-memory registry, so
//! multi-step flows (`request-merge` then `confirm-merge`) need PostgreSQL.
#![cfg_attr(not(any(test, doctest)), deny(clippy::unwrap_used))]
#![cfg_attr(not(any(test, doctest)), deny(clippy::expect_used))]

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Report, Result, eyre};
use identity_isolation::domain::{
    Error as DomainError, GroupId, RequestContext, RequestMergeOutcome, ScopeRequest, ThreadId,
    VerificationMethod,
};
use identity_isolation::outbound::persistence::run_pending_migrations;
use identity_isolation::{Isolation, IsolationSettings};
use mockable::DefaultClock;
use ortho_config::OrthoConfig;
use serde_json::{Value, json};
use tokio::runtime::Builder;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

/// `isolation-admin` command arguments.
#[derive(Debug, Parser)]
#[command(
    name = "isolation-admin",
    about = "Inspect and operate identity scopes and storage roots",
    version
)]
struct CliArgs {
    /// Override the storage data root.
    #[arg(long = "data-root", value_name = "path", global = true)]
    data_root: Option<PathBuf>,
    /// Override the PostgreSQL URL.
    #[arg(long = "database-url", value_name = "url", global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations.
    Migrate,
    /// Print the storage root a request context resolves to.
    Resolve {
        #[arg(long = "thread-id")]
        thread_id: String,
        #[arg(long = "group-id")]
        group_id: Option<String>,
        /// Resolve the shared scope instead of the context scope.
        #[arg(long)]
        shared: bool,
        /// Create the root as a write would.
        #[arg(long)]
        write: bool,
    },
    /// Issue a verification code for a thread.
    RequestMerge {
        #[arg(long = "thread-id")]
        thread_id: String,
        #[arg(long)]
        contact: String,
        #[arg(long, default_value = "email")]
        method: String,
    },
    /// Confirm a verification code and merge the thread's storage.
    ConfirmMerge {
        #[arg(long = "thread-id")]
        thread_id: String,
        #[arg(long)]
        code: String,
    },
    /// Merge another thread into a verified caller's user.
    MergeAdditional {
        #[arg(long = "caller-thread-id")]
        caller_thread_id: String,
        #[arg(long = "other-thread-id")]
        other_thread_id: String,
    },
    /// Rescan a thread's storage root and rewrite its manifest.
    RebuildManifest {
        #[arg(long = "thread-id")]
        thread_id: String,
        #[arg(long = "group-id")]
        group_id: Option<String>,
        #[arg(long)]
        shared: bool,
    },
    /// Delete expired verification codes.
    PurgeCodes,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let args = CliArgs::parse();
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("create Tokio runtime")?;
    runtime.block_on(run(args))
}

fn load_settings(args: &CliArgs) -> Result<IsolationSettings> {
    let mut settings = IsolationSettings::load_from_iter([OsString::from("isolation-admin")])
        .map_err(|err| eyre!("failed to load settings: {err}"))?;
    if let Some(data_root) = &args.data_root {
        settings.data_root = Some(data_root.clone());
    }
    if let Some(url) = &args.database_url {
        settings.database_url = Some(url.clone());
    }
    Ok(settings)
}

async fn run(args: CliArgs) -> Result<()> {
    let settings = load_settings(&args)?;

    if matches!(args.command, Command::Migrate) {
        let url = settings
            .database_url()
            .ok_or_else(|| eyre!("migrate needs --database-url or ISOLATION_DATABASE_URL"))?
            .to_owned();
        let applied = tokio::task::spawn_blocking(move || run_pending_migrations(&url))
            .await
            .wrap_err("migration task failed")?
            .map_err(Report::new)?;
        return emit(&json!({ "applied": applied }));
    }

    let isolation = Isolation::connect(&settings, Arc::new(DefaultClock))
        .await
        .map_err(Report::new)?;
    let output = match execute(&isolation, args.command).await {
        Ok(output) => output,
        Err(error) => {
            emit(&json!({ "error": error }))?;
            return Err(Report::new(error));
        }
    };
    emit(&output)
}

async fn execute(
    isolation: &Isolation,
    command: Command,
) -> std::result::Result<Value, DomainError> {
    match command {
        Command::Migrate => Ok(Value::Null),
        Command::Resolve {
            thread_id,
            group_id,
            shared,
            write,
        } => {
            let context = context(&thread_id, group_id, shared)?;
            let scope = if write {
                isolation.prepare_write(&context).await?
            } else {
                isolation.resolve_scope(&context).await?
            };
            Ok(json!({
                "kind": scope.kind().as_str(),
                "key": scope.key(),
                "root": scope.root().display().to_string(),
            }))
        }
        Command::RequestMerge {
            thread_id,
            contact,
            method,
        } => {
            let method = method
                .parse::<VerificationMethod>()
                .map_err(|err| DomainError::invalid_request(err.to_string()))?;
            let outcome = isolation
                .request_merge(&thread(&thread_id)?, &contact, method)
                .await?;
            Ok(match outcome {
                RequestMergeOutcome::CodeIssued { expires_at } => {
                    json!({ "status": "code_issued", "expires_at": expires_at })
                }
                RequestMergeOutcome::AlreadyVerified(persistent_user_id) => json!({
                    "status": "already_verified",
                    "persistent_user_id": persistent_user_id,
                }),
            })
        }
        Command::ConfirmMerge { thread_id, code } => {
            let persistent_user_id = isolation.confirm_merge(&thread(&thread_id)?, &code).await?;
            Ok(json!({ "persistent_user_id": persistent_user_id }))
        }
        Command::MergeAdditional {
            caller_thread_id,
            other_thread_id,
        } => {
            let identity = isolation
                .merge_additional(&thread(&caller_thread_id)?, &thread(&other_thread_id)?)
                .await?;
            Ok(json!({ "identity": identity }))
        }
        Command::RebuildManifest {
            thread_id,
            group_id,
            shared,
        } => {
            let scope = isolation
                .resolve_scope(&context(&thread_id, group_id, shared)?)
                .await?;
            let manifest = isolation.rebuild_manifest(&scope).await?;
            Ok(json!({ "root": scope.root().display().to_string(), "manifest": manifest }))
        }
        Command::PurgeCodes => {
            let purged = isolation.purge_expired_codes().await?;
            Ok(json!({ "purged": purged }))
        }
    }
}

fn thread(raw: &str) -> std::result::Result<ThreadId, DomainError> {
    ThreadId::new(raw)
        .map_err(|err| DomainError::invalid_request(err.to_string()))
}

fn context(
    thread_id: &str,
    group_id: Option<String>,
    shared: bool,
) -> std::result::Result<RequestContext, DomainError> {
    let mut context = RequestContext::new(thread(thread_id)?);
    if let Some(group_id) = group_id {
        let group_id = GroupId::new(group_id)
            .map_err(|err| DomainError::invalid_request(err.to_string()))?;
        context = context.with_group(group_id);
    }
    if shared {
        context = context.with_scope(ScopeRequest::Shared);
    }
    Ok(context)
}

fn emit(value: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).wrap_err("render output")?;
    println!("{rendered}");
    Ok(())
}
