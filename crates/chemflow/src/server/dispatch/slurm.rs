use anyhow::Context;
use bstr::ByteSlice;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::Map;
use crate::model::JobStatus;
use crate::server::dispatch::backend::{
    BackendError, BackendJobDescription, BackendJobRef, BackendResult, BackendSubmission,
    ComputeBackend,
};

/// Name of the batch script written into the job directory.
const SUBMIT_SCRIPT_NAME: &str = "chemflow-submit.sh";

/// Name of a file that stores the Slurm id of a submitted job.
const JOBID_FILE_NAME: &str = "jobid";

const SLURM_STATUS_TABLE: &[(&str, JobStatus)] = &[
    ("PENDING", JobStatus::Submitted),
    ("CONFIGURING", JobStatus::Submitted),
    ("REQUEUED", JobStatus::Submitted),
    ("RUNNING", JobStatus::Running),
    ("COMPLETING", JobStatus::Running),
    ("COMPLETED", JobStatus::Succeeded),
    ("FAILED", JobStatus::Failed),
    ("TIMEOUT", JobStatus::Failed),
    ("NODE_FAIL", JobStatus::Failed),
    ("OUT_OF_MEMORY", JobStatus::Failed),
    ("BOOT_FAIL", JobStatus::Failed),
    ("DEADLINE", JobStatus::Failed),
    ("PREEMPTED", JobStatus::Failed),
    ("CANCELLED", JobStatus::Canceled),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// Directory where job scripts and model output logs are created.
    pub work_dir: PathBuf,
    /// Command that runs the model container; the image name is appended.
    pub container_command: String,
    /// Extra `#SBATCH` lines, e.g. `--account=chem`.
    pub additional_args: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("slurm-jobs"),
            container_command: "apptainer run".to_string(),
            additional_args: Vec::new(),
        }
    }
}

pub struct SlurmBackend {
    config: SlurmConfig,
}

impl SlurmBackend {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    fn job_dir(&self, idempotency_key: &str) -> PathBuf {
        self.config.work_dir.join("jobs").join(idempotency_key)
    }

    async fn submit_job(&self, submission: BackendSubmission) -> BackendResult<BackendJobRef> {
        let directory = self.job_dir(&submission.idempotency_key);
        let jobid_path = directory.join(JOBID_FILE_NAME);
        if let Ok(job_id) = std::fs::read_to_string(&jobid_path) {
            log::debug!(
                "Job {} was already submitted as {}",
                submission.idempotency_key,
                job_id.trim()
            );
            return Ok(job_id.trim().to_string());
        }

        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Cannot create job directory {}", directory.display()))
            .map_err(unavailable)?;

        if let Some(job_id) = find_queued_job(&submission.job_name, &directory).await? {
            log::debug!(
                "Job {} found in the Slurm queue as {job_id}",
                submission.idempotency_key
            );
            std::fs::write(&jobid_path, &job_id).map_err(|e| unavailable(e.into()))?;
            return Ok(job_id);
        }

        let script = build_sbatch_script(
            &submission,
            &directory.join("stdout").display().to_string(),
            &directory.join("stderr").display().to_string(),
            &self.config.additional_args,
            &format!("{} {}", self.config.container_command, submission.image),
        );
        let script_path = directory.join(SUBMIT_SCRIPT_NAME);
        std::fs::write(&script_path, script)
            .with_context(|| format!("Cannot write script into {}", script_path.display()))
            .map_err(unavailable)?;

        let script_path = script_path.display().to_string();
        let output = run_slurm_command(vec!["sbatch", &script_path], &directory).await?;
        log::debug!("Sbatch output: {output}");
        let job_id = parse_sbatch_output(&output).ok_or_else(|| {
            BackendError::Rejected(format!("Missing job id in sbatch output\n{output}"))
        })?;

        // Written after the submission so that a retry finds the existing job
        std::fs::write(&jobid_path, &job_id).map_err(|e| unavailable(e.into()))?;
        Ok(job_id)
    }

    async fn describe_job(&self, job_ref: &str) -> BackendResult<BackendJobDescription> {
        let output = run_slurm_command(
            vec!["scontrol", "show", "job", job_ref],
            &self.config.work_dir,
        )
        .await
        .map_err(|error| match error {
            BackendError::Rejected(message) if is_invalid_job_id(&message) => {
                BackendError::JobNotFound(job_ref.to_string())
            }
            error => error,
        })?;
        parse_slurm_job(get_scontrol_items(&output))
            .ok_or_else(|| BackendError::JobNotFound(job_ref.to_string()))
    }

    async fn cancel_job(&self, job_ref: &str) -> BackendResult<()> {
        run_slurm_command(vec!["scancel", job_ref], &self.config.work_dir)
            .await
            .map_err(|error| match error {
                BackendError::Rejected(message) if is_invalid_job_id(&message) => {
                    BackendError::JobNotFound(job_ref.to_string())
                }
                error => error,
            })?;
        Ok(())
    }
}

impl ComputeBackend for SlurmBackend {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn status_table(&self) -> &'static [(&'static str, JobStatus)] {
        SLURM_STATUS_TABLE
    }

    fn submit(&self, submission: BackendSubmission) -> BoxFuture<'_, BackendResult<BackendJobRef>> {
        self.submit_job(submission).boxed()
    }

    fn describe<'a>(
        &'a self,
        job_ref: &'a str,
    ) -> BoxFuture<'a, BackendResult<BackendJobDescription>> {
        self.describe_job(job_ref).boxed()
    }

    fn cancel<'a>(&'a self, job_ref: &'a str, reason: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        log::debug!("Canceling Slurm job {job_ref}: {reason}");
        self.cancel_job(job_ref).boxed()
    }
}

fn unavailable(error: anyhow::Error) -> BackendError {
    BackendError::Unavailable(format!("{error:#}"))
}

fn is_invalid_job_id(message: &str) -> bool {
    message.to_lowercase().contains("invalid job id")
}

fn is_controller_unreachable(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ["unable to contact slurm controller", "socket timed out", "connection refused"]
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

/// Classifies a failed Slurm command: an unreachable controller is worth retrying,
/// anything else is a refusal.
fn check_command_output(output: Output) -> BackendResult<Output> {
    let status = output.status;
    if status.success() {
        return Ok(output);
    }
    let stderr = output.stderr.to_str_lossy();
    let message = format!(
        "Exit code: {}\nStderr: {}\nStdout: {}",
        status.code().unwrap_or(-1),
        stderr.trim(),
        output.stdout.to_str_lossy().trim()
    );
    if is_controller_unreachable(&stderr) {
        Err(BackendError::Unavailable(message))
    } else {
        Err(BackendError::Rejected(message))
    }
}

async fn run_slurm_command(arguments: Vec<&str>, workdir: &Path) -> BackendResult<String> {
    log::debug!("Running Slurm command `{}`", arguments.join(" "));
    let program = arguments.first().copied().unwrap_or_default().to_string();
    let output = create_command(arguments, workdir)
        .output()
        .await
        .with_context(|| format!("{program} start failed"))
        .map_err(unavailable)?;
    let output = check_command_output(output)?;
    Ok(output.stdout.to_str_lossy().trim().to_string())
}

async fn find_queued_job(job_name: &str, workdir: &Path) -> BackendResult<Option<BackendJobRef>> {
    let name = format!("--name={job_name}");
    let output = run_slurm_command(
        vec!["squeue", "--noheader", "--format=%i", &name],
        workdir,
    )
    .await?;
    Ok(output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string))
}

fn parse_sbatch_output(output: &str) -> Option<BackendJobRef> {
    output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .map(|l| l.to_string())
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.trim().split(' ') {
            if let Some((key, value)) = item.split_once('=') {
                map.insert(key, value);
            }
        }
    }
    map
}

fn parse_slurm_datetime(value: &str) -> Option<DateTime<Utc>> {
    let datetime = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&datetime)
        .single()
        .map(|time| time.with_timezone(&Utc))
}

fn parse_slurm_job(items: Map<&str, &str>) -> Option<BackendJobDescription> {
    let native_status = items.get("JobState")?;
    let reason = items
        .get("Reason")
        .filter(|reason| !reason.eq_ignore_ascii_case("none"))
        .map(|reason| reason.to_string());
    Some(BackendJobDescription {
        native_status: native_status.to_string(),
        started_at: items.get("StartTime").and_then(|t| parse_slurm_datetime(t)),
        stopped_at: items.get("EndTime").and_then(|t| parse_slurm_datetime(t)),
        progress: None,
        reason,
    })
}

/// Formats a duration as a Slurm time limit, e.g. `1-02:03:04`.
fn format_slurm_time(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
}

/// Single-quotes `value` for bash; embedded quotes are closed, escaped and reopened.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn build_sbatch_script(
    submission: &BackendSubmission,
    stdout: &str,
    stderr: &str,
    sbatch_args: &[String],
    run_cmd: &str,
) -> String {
    let mut script = format!(
        r##"#!/bin/bash
#SBATCH --job-name={name}
#SBATCH --partition={queue}
#SBATCH --nodes={nodes}
#SBATCH --ntasks-per-node={tasks}
#SBATCH --mem={memory}M
#SBATCH --time={walltime}
#SBATCH --output={stdout}
#SBATCH --error={stderr}
"##,
        name = submission.job_name,
        queue = submission.queue,
        nodes = submission.nodes,
        tasks = submission.vcpus_per_node,
        memory = submission.memory_mib_per_node,
        walltime = format_slurm_time(submission.timeout),
        stdout = stdout,
        stderr = stderr,
    );
    for arg in sbatch_args {
        let _ = writeln!(script, "#SBATCH {arg}");
    }

    script.push('\n');
    for (key, value) in &submission.environment {
        let _ = writeln!(script, "export {key}={}", shell_quote(value));
    }

    // MPI ranks of a multi-node run are spread over all allocated nodes
    let prefix = if submission.nodes > 1 {
        format!(
            "srun --nodes={} --ntasks-per-node={} ",
            submission.nodes, submission.vcpus_per_node
        )
    } else {
        "".to_string()
    };
    let _ = write!(script, "\n{prefix}{run_cmd}");
    script
}
