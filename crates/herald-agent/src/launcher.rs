use std::{collections::BTreeMap, sync::Arc};

use herald_job::{JobId, JobKind, OwnerId};

use crate::error::JobError;
use crate::log_sink::LogSink;
use crate::process::JobProcess;
use crate::registry::{ExitHook, JobExit, JobRegistry};
use crate::scope::OwnerScope;
use crate::settings::AgentSettings;
use crate::staging::StagedSecrets;
use crate::templates::TemplateSet;

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub owner: OwnerId,
    pub kind: JobKind,
    pub args: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    /// Paths relative to the owner's storage scope.
    pub working_files: Vec<String>,
}

/// Turns validated requests into registered, running jobs.
#[derive(Clone, Debug)]
pub struct JobLauncher {
    registry: JobRegistry,
    settings: Arc<AgentSettings>,
    templates: Arc<TemplateSet>,
}

impl JobLauncher {
    pub fn new(registry: JobRegistry, settings: AgentSettings, templates: TemplateSet) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
            templates: Arc::new(templates),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn scope_for(&self, owner: &OwnerId) -> OwnerScope {
        OwnerScope::new(&self.settings.storage_root, owner)
    }

    /// Validate, stage secrets, spawn and register. Returns as soon as the
    /// process exists; the job's exit observer deletes the secrets file.
    pub async fn launch(&self, req: LaunchRequest) -> Result<JobId, JobError> {
        let LaunchRequest {
            owner,
            kind,
            args,
            secrets,
            working_files,
        } = req;

        if owner.as_str().trim().is_empty() {
            return Err(JobError::invalid("owner id is empty"));
        }
        let template = self
            .templates
            .get(kind)
            .ok_or_else(|| JobError::invalid(format!("job kind {kind} is not available")))?;

        let secrets: Vec<String> = secrets
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if secrets.is_empty() {
            return Err(JobError::invalid("at least one token is required"));
        }

        let scope = self.scope_for(&owner);
        let files = scope.resolve_all(&working_files).await?;
        let invocation = template.render(&args, &files, scope.root())?;

        if invocation.needs_scope_dir {
            scope.ensure_exists().await.map_err(JobError::Staging)?;
        }

        let staged = StagedSecrets::write(&self.settings.scratch_dir, &owner, kind, &secrets)
            .await
            .map_err(JobError::Staging)?;

        let spawned = {
            let mut cmd = invocation.command(staged.path());
            JobProcess::spawn(&mut cmd)
        };
        let mut process = match spawned {
            Ok(p) => p,
            Err(source) => {
                staged.remove().await;
                return Err(JobError::Spawn {
                    program: invocation.program.clone(),
                    source,
                });
            }
        };
        let pid = process.pid();
        let (stdout, stderr) = process.take_output();

        let hook: ExitHook = Box::new(move |exit: JobExit| {
            Box::pin(async move {
                staged.remove().await;
                tracing::debug!(job_id = %exit.job_id, outcome = ?exit.outcome, "job cleanup done");
            })
        });

        let job_id = self
            .registry
            .register(owner.clone(), kind, process, Some(hook))
            .await;

        let sink = LogSink::open(
            job_id.clone(),
            self.settings.job_log_dir.as_deref(),
            self.settings.job_logs,
        )
        .await;
        if let Some(out) = stdout {
            sink.drain(out, "stdout");
        }
        if let Some(err) = stderr {
            sink.drain(err, "stderr");
        }

        tracing::info!(
            %job_id,
            %owner,
            %kind,
            ?pid,
            program = %invocation.program,
            working_files = files.len(),
            "job launched"
        );
        Ok(job_id)
    }
}
