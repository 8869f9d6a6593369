use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use itools_runner::{
    config::SlaveConfig,
    master::{Coordinator, MasterError, MpiTask},
    messages::{
        self, Command, CommonFile, InputFile, OutputFile, PostProcessor, PreProcessor, Scope,
        Task, TaskResult, Variable,
    },
    slave::{run_slave, SlaveError},
    staging,
    step::Step,
    transport::{
        local::{LocalCluster, LocalTransport},
        TransportError,
    },
};
use std::{
    fs,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tempfile::TempDir;

struct Cluster {
    coordinator: Coordinator<LocalTransport>,
    slaves: Vec<JoinHandle<Result<(), SlaveError>>>,
    scratch: TempDir,
}

impl Cluster {
    fn start(ranks: usize, cores: usize, archive_dir: Option<&Path>) -> Self {
        let scratch = TempDir::new().unwrap();
        let mut transports = LocalCluster::new(ranks + 1);
        let master = transports.remove(0);

        let slaves = transports
            .into_iter()
            .map(|transport| {
                let config = SlaveConfig {
                    tmp_dir: scratch.path().to_path_buf(),
                    cores,
                    archive_dir: archive_dir.map(Path::to_path_buf),
                    verbose: true,
                    log_file: None,
                };

                thread::spawn(move || run_slave(transport, &config))
            })
            .collect();

        let coordinator = Coordinator::init(master, cores).unwrap();

        Self {
            coordinator,
            slaves,
            scratch,
        }
    }

    fn local_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn run(&mut self, tasks: Vec<MpiTask>) -> Vec<MpiTask> {
        self.coordinator.start_tasks(&tasks).unwrap();

        let mut running = tasks;
        let mut completed = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(60);

        while !running.is_empty() {
            self.coordinator
                .check_tasks_completion(&mut running, &mut completed)
                .unwrap();

            assert!(Instant::now() < deadline, "tasks did not complete in time");
            thread::sleep(Duration::from_millis(5));
        }

        completed.sort_by_key(|task| task.id);
        completed
    }

    fn broadcast(&mut self, name: &str, data: &[u8], chunk_size: usize) {
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();

        for (index, chunk) in chunks.iter().enumerate() {
            let message = messages::encode(&CommonFile {
                name: String::from(name),
                chunk: index as u32,
                last: index + 1 == chunks.len(),
                data: chunk.to_vec(),
            })
            .unwrap();

            self.coordinator.broadcast_common_file(&message).unwrap();
        }
    }

    fn shutdown(self) -> TempDir {
        self.coordinator.shutdown().unwrap();

        for slave in self.slaves {
            slave.join().unwrap().unwrap();
        }

        self.scratch
    }

    /// poll `running` until the cluster aborts
    fn wait_for_abort(&mut self, mut running: Vec<MpiTask>) -> MasterError {
        let deadline = Instant::now() + Duration::from_secs(60);

        loop {
            match self
                .coordinator
                .check_tasks_completion(&mut running, &mut Vec::new())
            {
                Ok(()) => {
                    assert!(Instant::now() < deadline, "the cluster did not abort");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(error) => break error,
            }
        }
    }
}

fn shell(script: &str) -> Command {
    Command {
        program: String::from("/bin/sh"),
        arguments: vec![String::from("-c"), String::from(script)],
        timeout: Some(30),
    }
}

fn task(job_id: i32, index: i32, init_job: bool, script: &str) -> Task {
    Task {
        job_id,
        index,
        cmd_id: String::from("cmd"),
        init_job,
        completed_job_ids: Vec::new(),
        input_files: Vec::new(),
        commands: vec![shell(script)],
        output_files: Vec::new(),
        env: Vec::new(),
    }
}

fn input(name: &str, scope: Scope, pre_processor: PreProcessor, data: Option<&[u8]>) -> InputFile {
    InputFile {
        name: String::from(name),
        scope,
        pre_processor,
        data: data.map(<[u8]>::to_vec),
    }
}

fn output(name: &str) -> OutputFile {
    OutputFile {
        name: String::from(name),
        post_processor: PostProcessor::None,
    }
}

fn dispatch(id: i32, rank: i32, thread: usize, task: &Task) -> MpiTask {
    MpiTask::new(id, rank, thread, messages::encode(task).unwrap())
}

fn result(task: &MpiTask) -> TaskResult {
    messages::decode(task.result.as_deref().unwrap()).unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
    decoded
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn entries(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .map_or(false, |name| name.to_string_lossy().starts_with(prefix))
        })
        .collect()
}

#[test]
fn successful_task_returns_outputs_and_stdout() {
    let mut cluster = Cluster::start(1, 1, None);
    let mut work = task(1, 4, true, "echo hello; printf result > out.txt");
    work.output_files = vec![
        output("out.txt"),
        OutputFile {
            name: String::from("out.txt"),
            post_processor: PostProcessor::FileGzip,
        },
    ];

    let completed = cluster.run(vec![dispatch(10, 1, 0, &work)]);
    let result = result(&completed[0]);

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.command_durations.len(), 1);
    assert_eq!(result.output_file("out.txt").unwrap().data, b"result");
    assert_eq!(gunzip(&result.output_file("out.txt.gz").unwrap().data), b"result");
    assert_eq!(
        gunzip(&result.output_file("cmd_4.out.gz").unwrap().data),
        b"hello\n"
    );
    assert!(result.working_data_size > 0);

    let scratch = cluster.shutdown();
    assert!(entries(scratch.path(), "itools_").is_empty());
}

#[test]
fn failing_task_is_archived() {
    let archive = TempDir::new().unwrap();
    let mut cluster = Cluster::start(1, 1, Some(archive.path()));
    let mut work = task(
        42,
        0,
        true,
        "printf partial > partial.txt; echo failing >&2; exit 3",
    );
    work.commands.push(shell("echo never > never.txt"));
    work.output_files = vec![output("never.txt")];

    let completed = cluster.run(vec![dispatch(1, 1, 0, &work)]);
    let result = result(&completed[0]);

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.command_durations.len(), 1);
    assert!(result.output_file("never.txt").is_none());
    assert_eq!(
        gunzip(&result.output_file("cmd_0.out.gz").unwrap().data),
        b"failing\n"
    );

    let mut zip = zip::ZipArchive::new(fs::File::open(archive.path().join("job-42.zip")).unwrap())
        .unwrap();
    let mut partial = String::new();
    zip.by_name("job-42/partial.txt")
        .unwrap()
        .read_to_string(&mut partial)
        .unwrap();
    assert_eq!(partial, "partial");

    cluster.shutdown();
}

#[test]
fn job_scoped_files_are_shared_by_the_tasks_of_a_job() {
    let mut cluster = Cluster::start(1, 1, None);
    let mut first = task(7, 0, true, "cat shared.dat > copy.txt");
    first.input_files = vec![input(
        "shared.dat",
        Scope::Job,
        PreProcessor::None,
        Some(&b"job data"[..]),
    )];
    first.output_files = vec![output("copy.txt")];
    let mut second = task(7, 1, false, "cat shared.dat > copy.txt");
    second.input_files = vec![input("shared.dat", Scope::Job, PreProcessor::None, None)];
    second.output_files = vec![output("copy.txt")];

    let first = cluster.run(vec![dispatch(1, 1, 0, &first)]);
    let second = cluster.run(vec![dispatch(2, 1, 0, &second)]);

    assert_eq!(result(&first[0]).output_file("copy.txt").unwrap().data, b"job data");
    assert_eq!(result(&second[0]).output_file("copy.txt").unwrap().data, b"job data");

    let job_dir = staging::job_dir(cluster.local_dir(), 1, 7);
    assert!(job_dir.is_dir());

    // a completed job is dropped by the next task reporting it
    let mut third = task(8, 0, true, "true");
    third.completed_job_ids = vec![7];
    cluster.run(vec![dispatch(3, 1, 0, &third)]);
    assert!(!job_dir.exists());

    cluster.shutdown();
}

#[test]
fn non_initializing_task_waits_for_the_job_initialization() {
    let mut cluster = Cluster::start(1, 2, None);
    let data: Vec<u8> = (0..=255u8).cycle().take(4 << 20).collect();

    let mut waiting = task(3, 1, false, "cat model.bin > copy.bin");
    waiting.input_files = vec![input("model.bin", Scope::Job, PreProcessor::None, None)];
    waiting.output_files = vec![output("copy.bin")];
    let mut initializing = task(3, 0, true, "cat model.bin > copy.bin");
    initializing.input_files = vec![input(
        "model.bin",
        Scope::Job,
        PreProcessor::None,
        Some(&data[..]),
    )];
    initializing.output_files = vec![output("copy.bin")];

    // the waiting task reaches its worker thread first
    let completed = cluster.run(vec![
        dispatch(1, 1, 0, &waiting),
        dispatch(2, 1, 1, &initializing),
    ]);

    for task in &completed {
        let result = result(task);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output_file("copy.bin").unwrap().data, data);
    }

    // job directories do not survive the end of the task execution step
    cluster.broadcast("marker", b"x", 1);
    assert!(entries(cluster.local_dir(), "itools_job_").is_empty());

    cluster.shutdown();
}

#[test]
fn chunked_common_file_is_reassembled_on_every_rank() {
    let mut cluster = Cluster::start(2, 1, None);
    let data: Vec<u8> = (0..100_000u32).map(|value| (value % 251) as u8).collect();

    cluster.broadcast("network.bin", &data, 30_000);

    for rank in [1, 2] {
        let common_dir = staging::common_dir(cluster.local_dir(), rank);
        assert_eq!(fs::read(common_dir.join("network.bin")).unwrap(), data);
        assert_eq!(entries(&common_dir, "network.bin").len(), 1);
    }

    let mut work = task(1, 0, true, "wc -c < network.bin | tr -d ' ' > size.txt");
    work.input_files = vec![input("network.bin", Scope::Run, PreProcessor::None, None)];
    work.output_files = vec![output("size.txt")];

    let completed = cluster.run(vec![dispatch(1, 1, 0, &work), dispatch(2, 2, 0, &work)]);
    for task in &completed {
        assert_eq!(result(task).output_file("size.txt").unwrap().data, b"100000\n");
    }

    let scratch = cluster.shutdown();
    assert!(!staging::common_dir(scratch.path(), 1).exists());
}

#[test]
fn run_scoped_archives_are_exploded_into_the_working_dir() {
    let mut cluster = Cluster::start(1, 2, None);
    let archive = zip_archive(&[("a.mo", "model a"), ("b.mo", "model b")]);

    cluster.broadcast("models.zip", &archive, 64);

    let mut work = task(1, 0, true, "cat a.mo b.mo > both.txt");
    work.input_files = vec![input("models.zip", Scope::Run, PreProcessor::ArchiveUnzip, None)];
    work.output_files = vec![output("both.txt")];

    let completed = cluster.run(vec![dispatch(1, 1, 0, &work), dispatch(2, 1, 1, &work)]);
    for task in &completed {
        assert_eq!(
            result(task).output_file("both.txt").unwrap().data,
            b"model amodel b"
        );
    }

    cluster.shutdown();
}

#[test]
fn task_environment_is_merged() {
    let mut cluster = Cluster::start(1, 1, None);
    let mut work = task(1, 0, true, "printf '%s|%s' \"$SOLVER_MODE\" \"$TMPDIR\" > env.txt");
    work.env = vec![Variable {
        name: String::from("SOLVER_MODE"),
        value: String::from("fast"),
    }];
    work.output_files = vec![output("env.txt")];

    let completed = cluster.run(vec![dispatch(1, 1, 0, &work)]);
    let working_dir = staging::working_dir(cluster.local_dir(), 1, 0);

    assert_eq!(
        result(&completed[0]).output_file("env.txt").unwrap().data,
        format!("fast|{}", working_dir.to_string_lossy()).into_bytes()
    );

    cluster.shutdown();
}

#[test]
fn steps_can_alternate_before_shutdown() {
    let mut cluster = Cluster::start(2, 2, None);

    for round in 0..2 {
        cluster.broadcast(&format!("round{round}.txt"), b"content", 4);
        assert_eq!(cluster.coordinator.step(), Step::CommonFilesBroadcast);

        let tasks = (1..=2)
            .flat_map(|rank| (0..2).map(move |thread| (rank, thread)))
            .enumerate()
            .map(|(id, (rank, thread))| {
                let job_id = round * 10 + id as i32;
                dispatch(id as i32, rank, thread, &task(job_id, 0, true, "true"))
            })
            .collect();

        let completed = cluster.run(tasks);
        assert_eq!(completed.len(), 4);
        assert_eq!(cluster.coordinator.step(), Step::TasksExecution);
    }

    cluster.shutdown();
}

#[test]
fn immediate_shutdown_stops_every_rank() {
    let cluster = Cluster::start(3, 2, None);

    let scratch = cluster.shutdown();

    assert!(entries(scratch.path(), "itools_").is_empty());
}

#[test]
fn worker_failure_aborts_the_cluster() {
    let mut cluster = Cluster::start(1, 1, None);
    let mut broken = task(1, 0, true, "true");
    broken.input_files = vec![input("missing.dat", Scope::Task, PreProcessor::None, None)];

    cluster
        .coordinator
        .start_tasks(&[dispatch(1, 1, 0, &broken)])
        .unwrap();

    let error = cluster.wait_for_abort(vec![dispatch(1, 1, 0, &broken)]);

    assert!(matches!(
        error,
        MasterError::Transport(TransportError::Aborted(-1))
    ));
    for slave in cluster.slaves {
        assert!(slave.join().unwrap().is_err());
    }
}

#[test]
fn failed_shutdown_aborts_every_rank() {
    let cluster = Cluster::start(2, 1, None);
    let Cluster {
        mut coordinator,
        slaves,
        scratch: _scratch,
    } = cluster;

    coordinator
        .start_tasks(&[dispatch(1, 1, 0, &task(1, 0, true, "true"))])
        .unwrap();

    assert!(matches!(
        coordinator.shutdown(),
        Err(MasterError::TasksInFlight(1))
    ));
    for slave in slaves {
        assert!(matches!(
            slave.join().unwrap(),
            Err(SlaveError::Transport(TransportError::Aborted(-1)))
        ));
    }
}

#[test]
fn missing_inputs_and_outputs_are_only_logged() {
    let mut cluster = Cluster::start(1, 1, None);
    cluster.run(vec![dispatch(1, 1, 0, &task(5, 0, true, "true"))]);

    let mut work = task(5, 1, false, "printf ok > out.txt");
    work.input_files = vec![
        input("absent-run.dat", Scope::Run, PreProcessor::None, None),
        input("absent-job.dat", Scope::Job, PreProcessor::None, None),
    ];
    work.output_files = vec![output("out.txt"), output("absent.txt")];

    let completed = cluster.run(vec![dispatch(2, 1, 0, &work)]);
    let result = result(&completed[0]);

    assert_eq!(result.exit_code, 0);
    let names: Vec<_> = result
        .output_files
        .iter()
        .map(|file| file.name.as_str())
        .collect();
    assert_eq!(names, ["cmd_1.out.gz", "out.txt"]);

    cluster.shutdown();
}

#[test]
fn vanished_job_directory_aborts_the_cluster() {
    let mut cluster = Cluster::start(1, 1, None);
    let mut first = task(6, 0, true, "true");
    first.input_files = vec![input(
        "shared.dat",
        Scope::Job,
        PreProcessor::None,
        Some(&b"job data"[..]),
    )];
    cluster.run(vec![dispatch(1, 1, 0, &first)]);

    fs::remove_dir_all(staging::job_dir(cluster.local_dir(), 1, 6)).unwrap();

    let mut second = task(6, 1, false, "cat shared.dat");
    second.input_files = vec![input("shared.dat", Scope::Job, PreProcessor::None, None)];
    cluster
        .coordinator
        .start_tasks(&[dispatch(2, 1, 0, &second)])
        .unwrap();

    let error = cluster.wait_for_abort(vec![dispatch(2, 1, 0, &second)]);

    assert!(matches!(
        error,
        MasterError::Transport(TransportError::Aborted(-1))
    ));
    for slave in cluster.slaves {
        assert!(matches!(
            slave.join().unwrap(),
            Err(SlaveError::AbortRequested)
        ));
    }
}

#[test]
fn rebroadcast_common_file_replaces_the_exploded_copy() {
    let mut cluster = Cluster::start(1, 1, None);
    let common_dir = staging::common_dir(cluster.local_dir(), 1);
    let archive = common_dir.join("model.txt.gz");

    let mut work = task(1, 0, true, "cat model.txt > copy.txt");
    work.input_files = vec![input("model.txt.gz", Scope::Run, PreProcessor::FileGunzip, None)];
    work.output_files = vec![output("copy.txt")];

    for (round, content) in [&b"version 1"[..], &b"version 2"[..]].into_iter().enumerate() {
        cluster.broadcast("model.txt.gz", &gzip(content), 16);
        assert!(!staging::exploded_archive_dir(&archive).exists());

        work.job_id = round as i32 + 1;
        let completed = cluster.run(vec![dispatch(round as i32, 1, 0, &work)]);

        assert_eq!(result(&completed[0]).output_file("copy.txt").unwrap().data, content);
        assert!(staging::exploded_archive_dir(&archive).is_dir());
    }

    cluster.shutdown();
}

#[test]
fn job_scoped_archives_are_exploded_for_every_task_of_the_job() {
    let mut cluster = Cluster::start(1, 2, None);
    let archive = zip_archive(&[("job.mo", "job model")]);

    let mut initializing = task(9, 0, true, "cat job.mo > copy.txt");
    initializing.input_files = vec![input(
        "models.zip",
        Scope::Job,
        PreProcessor::ArchiveUnzip,
        Some(&archive[..]),
    )];
    initializing.output_files = vec![output("copy.txt")];
    let mut waiting = task(9, 1, false, "cat job.mo > copy.txt");
    waiting.input_files = vec![input("models.zip", Scope::Job, PreProcessor::ArchiveUnzip, None)];
    waiting.output_files = vec![output("copy.txt")];

    let completed = cluster.run(vec![
        dispatch(1, 1, 0, &initializing),
        dispatch(2, 1, 1, &waiting),
    ]);

    for task in &completed {
        assert_eq!(result(task).output_file("copy.txt").unwrap().data, b"job model");
    }

    cluster.shutdown();
}
