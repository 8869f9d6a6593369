use super::{
    context::{Inbound, RankContext, WorkerState},
    SlaveError,
};
use crate::{
    exec,
    messages::{self, PostProcessor, ResultFile, Scope, Task, TaskResult},
    staging::{self, IoContext},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, debug_span, error, info_span, trace};

/// marks the slot stopped however the worker thread ends
struct StopGuard<'a> {
    context: &'a RankContext,
    thread: usize,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(thread = self.thread, "Worker thread panicked");
            self.context.request_abort();
        }

        self.context
            .set_worker_state(self.thread, WorkerState::Stopped);
    }
}

/// body of one worker thread, errors are fatal to the whole rank
pub(crate) fn run(context: Arc<RankContext>, thread: usize) {
    let span = info_span!("worker", rank = context.rank, thread);
    let _enter = span.enter();
    let _guard = StopGuard {
        context: &context,
        thread,
    };

    if let Err(error) = work(&context, thread) {
        error!(error = ?error, "Worker thread failed: {error}");

        context.request_abort();
    }
}

fn work(context: &RankContext, thread: usize) -> Result<(), SlaveError> {
    let working_dir = staging::working_dir(&context.local_dir, context.rank, thread);
    staging::recreate_dir(&working_dir)?;

    while let Inbound::Task(buffer) = context.request_task(thread) {
        let result = execute(context, &working_dir, &buffer)?;

        if !context.deliver_result(thread, result) {
            break;
        }

        staging::clean_dir(&working_dir)?;
    }

    debug!("stopping");
    staging::remove_dir(&working_dir)?;

    Ok(())
}

fn job_dir(context: &RankContext, job_id: messages::JobId) -> PathBuf {
    staging::job_dir(&context.local_dir, context.rank, job_id)
}

/// Make the job directory of `task` usable
///
/// The job initializing task stores the job scoped files and wakes the other worker threads, any
/// other task of the job waits for it.
fn prepare_job(context: &RankContext, task: &Task) -> Result<PathBuf, SlaveError> {
    for job_id in &task.completed_job_ids {
        trace!(job = job_id, "removing completed job");

        context.forget_job(*job_id);
        staging::remove_dir(&job_dir(context, *job_id))?;
    }

    let job_dir = job_dir(context, task.job_id);

    if task.init_job {
        staging::recreate_dir(&job_dir)?;

        for input_file in task
            .input_files
            .iter()
            .filter(|input_file| input_file.scope == Scope::Job)
        {
            debug!("receiving job scoped file '{}'", input_file.name);
            staging::store_input_file(input_file, &job_dir)?;
        }

        context.mark_job_initialized(task.job_id);
    } else if !context.wait_job_initialized(task.job_id) {
        return Err(SlaveError::AbortRequested);
    }

    Ok(job_dir)
}

fn stage_inputs(
    context: &RankContext,
    task: &Task,
    job_dir: &Path,
    working_dir: &Path,
) -> Result<(), SlaveError> {
    let common_dir = staging::common_dir(&context.local_dir, context.rank);

    for input_file in &task.input_files {
        let shared = match input_file.scope {
            Scope::Task => {
                debug!("receiving task scoped file '{}'", input_file.name);
                staging::write_input_file(input_file, working_dir)?;

                continue;
            }
            Scope::Run => common_dir.join(&input_file.name),
            Scope::Job => {
                if !job_dir.is_dir() {
                    return Err(SlaveError::UnknownJob(task.job_id));
                }

                job_dir.join(&input_file.name)
            }
        };

        if shared.exists() {
            staging::link_input_file(
                input_file.pre_processor,
                &shared,
                working_dir,
                context.explode_lock(),
            )?;
        } else {
            error!(
                scope = ?input_file.scope,
                "Input file '{}' not found",
                shared.to_string_lossy()
            );
        }
    }

    Ok(())
}

fn collect_outputs(
    task: &Task,
    working_dir: &Path,
    stdout_name: &str,
    exit_code: i32,
) -> Result<Vec<ResultFile>, SlaveError> {
    let mut output_files = Vec::with_capacity(task.output_files.len() + 1);

    let stdout_path = working_dir.join(stdout_name);
    if stdout_path.exists() {
        output_files.push(ResultFile {
            name: format!("{stdout_name}.gz"),
            data: staging::gzip_file(&stdout_path)?,
        });
    }

    for output_file in &task.output_files {
        let path = working_dir.join(&output_file.name);

        if !path.exists() {
            if exit_code == 0 {
                error!("Output file '{}' not found", output_file.name);
            }
            continue;
        }

        let result_file = match output_file.post_processor {
            PostProcessor::None => ResultFile {
                name: output_file.name.clone(),
                data: fs::read(&path).at(&path)?,
            },
            PostProcessor::FileGzip => ResultFile {
                name: format!("{}.gz", output_file.name),
                data: staging::gzip_file(&path)?,
            },
        };

        debug!("sending file '{}'", result_file.name);
        output_files.push(result_file);
    }

    Ok(output_files)
}

fn archive_working_dir(context: &RankContext, task: &Task, working_dir: &Path) {
    let Some(ref archive_dir) = context.archive_dir else {
        return;
    };

    let name = format!("job-{}", task.job_id);
    let zip_file = archive_dir.join(format!("{name}.zip"));

    debug!(archive = ?zip_file, "archiving the working directory");
    if let Err(error) = staging::zip_dir(working_dir, &zip_file, &name) {
        error!(error = ?error, "Failed to archive the working directory: {error}");
    }
}

/// run one task inside `working_dir` and return the encoded result
fn execute(
    context: &RankContext,
    working_dir: &Path,
    buffer: &[u8],
) -> Result<Vec<u8>, SlaveError> {
    let start = Instant::now();
    let task: Task = messages::decode(buffer)?;

    let span = debug_span!(
        "task",
        job = task.job_id,
        index = task.index,
        cmd = %task.cmd_id
    );
    let _enter = span.enter();

    let job_dir = prepare_job(context, &task)?;
    stage_inputs(context, &task, &job_dir, working_dir)?;

    let environment = exec::build_environment(std::env::vars(), &task.env, working_dir);
    let stdout_name = task.stdout_file_name();
    let execution = exec::run_commands(
        &task.commands,
        working_dir,
        &environment,
        &working_dir.join(&stdout_name),
    )?;

    if execution.exit_code != 0 {
        archive_working_dir(context, &task, working_dir);
    }

    let working_data_size = staging::dir_size(working_dir);
    let output_files = collect_outputs(&task, working_dir, &stdout_name, execution.exit_code)?;

    let result = TaskResult {
        exit_code: execution.exit_code,
        working_data_size,
        output_files,
        command_durations: execution.durations,
        task_duration: start.elapsed().as_millis() as u64,
    };

    debug!(
        exit_code = result.exit_code,
        duration = result.task_duration,
        "task done"
    );

    Ok(messages::encode(&result)?)
}
