use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use herald_job::JobKind;
use tokio::process::Command;

use crate::error::JobError;
use crate::settings::AgentSettings;

/// How a template maps one request parameter onto the commandline.
#[derive(Debug, Clone)]
pub enum ArgSpec {
    /// `flag value`; required unless a default is given.
    Value {
        key: String,
        flag: String,
        default: Option<String>,
        numeric: bool,
    },
    /// Bare `flag`, emitted when the parsed boolean equals `emit_when`.
    /// A missing key reads as `false`.
    Switch {
        key: String,
        flag: String,
        emit_when: bool,
    },
}

impl ArgSpec {
    fn required(key: &str, flag: &str) -> Self {
        ArgSpec::Value {
            key: key.to_string(),
            flag: flag.to_string(),
            default: None,
            numeric: false,
        }
    }

    fn number(key: &str, flag: &str, default: Option<&str>) -> Self {
        ArgSpec::Value {
            key: key.to_string(),
            flag: flag.to_string(),
            default: default.map(str::to_string),
            numeric: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretsDelivery {
    Flag(String),
    Env(String),
}

/// Fixed spawn recipe for one job kind. Callers pick a kind and supply
/// parameters; they never choose the program.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub kind: JobKind,
    pub program: String,
    /// Arguments placed before everything else (usually the script path).
    pub leading_args: Vec<String>,
    pub fixed_args: Vec<String>,
    pub params: Vec<ArgSpec>,
    pub working_file_flag: Option<String>,
    pub min_working_files: usize,
    /// Passes the owner's storage directory, created on demand.
    pub scope_flag: Option<String>,
    pub secrets: SecretsDelivery,
    pub cwd: Option<PathBuf>,
}

/// A rendered invocation still missing the staged secrets path.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    leading_args: Vec<String>,
    args: Vec<String>,
    secrets: SecretsDelivery,
    cwd: Option<PathBuf>,
    pub needs_scope_dir: bool,
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn check_numeric(key: &str, v: &str) -> Result<(), JobError> {
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Ok(()),
        _ => Err(JobError::invalid(format!(
            "parameter {key} must be a non-negative number, got {v:?}"
        ))),
    }
}

impl JobTemplate {
    pub fn render(
        &self,
        params: &BTreeMap<String, String>,
        working_files: &[PathBuf],
        scope_dir: &Path,
    ) -> Result<Invocation, JobError> {
        let mut args = self.fixed_args.clone();

        for param in &self.params {
            match param {
                ArgSpec::Value {
                    key,
                    flag,
                    default,
                    numeric,
                } => {
                    let v = params
                        .get(key)
                        .map(|v| v.trim())
                        .filter(|v| !v.is_empty())
                        .or(default.as_deref())
                        .ok_or_else(|| {
                            JobError::invalid(format!("missing required parameter: {key}"))
                        })?;
                    if *numeric {
                        check_numeric(key, v)?;
                    }
                    args.push(flag.clone());
                    args.push(v.to_string());
                }
                ArgSpec::Switch {
                    key,
                    flag,
                    emit_when,
                } => {
                    let on = params.get(key).is_some_and(|v| parse_bool(v));
                    if on == *emit_when {
                        args.push(flag.clone());
                    }
                }
            }
        }

        if working_files.len() < self.min_working_files {
            return Err(JobError::invalid(format!(
                "{} requires at least {} working file(s)",
                self.kind, self.min_working_files
            )));
        }
        if let Some(flag) = &self.working_file_flag {
            for f in working_files {
                args.push(flag.clone());
                args.push(f.display().to_string());
            }
        }

        if let Some(flag) = &self.scope_flag {
            args.push(flag.clone());
            args.push(scope_dir.display().to_string());
        }

        Ok(Invocation {
            program: self.program.clone(),
            leading_args: self.leading_args.clone(),
            args,
            secrets: self.secrets.clone(),
            cwd: self.cwd.clone(),
            needs_scope_dir: self.scope_flag.is_some(),
        })
    }
}

impl Invocation {
    /// Full argv after the program, with the secrets path in place.
    pub fn argv(&self, secrets_path: &Path) -> Vec<String> {
        let mut argv = self.leading_args.clone();
        if let SecretsDelivery::Flag(flag) = &self.secrets {
            argv.push(flag.clone());
            argv.push(secrets_path.display().to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn command(&self, secrets_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(secrets_path));
        if let SecretsDelivery::Env(var) = &self.secrets {
            cmd.env(var, secrets_path);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// The kinds this server can run, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<JobKind, JobTemplate>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, t: JobTemplate) {
        self.templates.insert(t.kind, t);
    }

    pub fn with(mut self, t: JobTemplate) -> Self {
        self.insert(t);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&JobTemplate> {
        self.templates.get(&kind)
    }

    /// The three worker scripts, run by `settings.program` from `script_dir`.
    pub fn builtin(settings: &AgentSettings) -> Self {
        let script = |name: &str| settings.script_dir.join(name).display().to_string();
        let cwd = Some(settings.script_dir.clone());

        let scrape = JobTemplate {
            kind: JobKind::Scrape,
            program: settings.program.clone(),
            leading_args: vec![script("scrape_discord_api.py")],
            fixed_args: vec!["-t".to_string(), "0".to_string()],
            params: vec![
                ArgSpec::required("channel", "-c"),
                ArgSpec::number("limit", "-l", None),
            ],
            working_file_flag: None,
            min_working_files: 0,
            scope_flag: Some("-o".to_string()),
            secrets: SecretsDelivery::Flag("--token-file".to_string()),
            cwd: cwd.clone(),
        };

        let auto_post = JobTemplate {
            kind: JobKind::AutoPost,
            program: settings.program.clone(),
            leading_args: vec![script("auto_post_delete.py")],
            fixed_args: Vec::new(),
            params: vec![
                ArgSpec::required("channel", "--channel"),
                ArgSpec::number("delay", "--delay", Some("2")),
                ArgSpec::number("delete_delay", "--delete-delay", Some("1")),
            ],
            working_file_flag: Some("--file".to_string()),
            min_working_files: 1,
            scope_flag: None,
            secrets: SecretsDelivery::Flag("--token-file".to_string()),
            cwd: cwd.clone(),
        };

        let simulate = JobTemplate {
            kind: JobKind::Simulate,
            program: settings.program.clone(),
            leading_args: vec![script("simulate_conversation.py")],
            fixed_args: Vec::new(),
            params: vec![
                ArgSpec::required("channel", "--channel"),
                ArgSpec::number("min_delay", "--min-delay", Some("30")),
                ArgSpec::number("max_delay", "--max-delay", Some("60")),
                ArgSpec::number("reaction_chance", "--reaction-chance", Some("0")),
                ArgSpec::number("reply_chance", "--reply-chance", Some("0")),
                ArgSpec::Switch {
                    key: "loop".to_string(),
                    flag: "--no-loop".to_string(),
                    emit_when: false,
                },
            ],
            working_file_flag: Some("--file".to_string()),
            min_working_files: 1,
            scope_flag: None,
            secrets: SecretsDelivery::Env("SIMULATE_TOKEN_FILE".to_string()),
            cwd,
        };

        Self::new().with(scrape).with(auto_post).with(simulate)
    }
}
