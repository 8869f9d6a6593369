use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_repr::*;
use thiserror::Error;

pub type JobId = i32;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to parse message")]
    Decode(#[source] bincode::Error),
    #[error("Failed to serialize message")]
    Encode(#[source] bincode::Error),
}

/// where an input file lives on the worker rank
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum Scope {
    /// broadcast once per run into the common directory
    Run = 0,
    /// cached in the job directory by the job initializing task
    Job = 1,
    /// delivered inline with the task
    Task = 2,
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[repr(u8)]
pub enum PreProcessor {
    #[default]
    None = 0,
    ArchiveUnzip = 1,
    FileGunzip = 2,
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[repr(u8)]
pub enum PostProcessor {
    #[default]
    None = 0,
    FileGzip = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub scope: Scope,
    #[serde(default)]
    pub pre_processor: PreProcessor,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    #[serde(default)]
    pub post_processor: PostProcessor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// one unit of work, sent by the coordinator to a worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub job_id: JobId,
    pub index: i32,
    pub cmd_id: String,
    pub init_job: bool,
    pub completed_job_ids: Vec<JobId>,
    pub input_files: Vec<InputFile>,
    pub commands: Vec<Command>,
    pub output_files: Vec<OutputFile>,
    pub env: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_code: i32,
    pub working_data_size: u64,
    pub output_files: Vec<ResultFile>,
    /// in ms
    pub command_durations: Vec<u64>,
    /// in ms
    pub task_duration: u64,
}

/// one chunk of a run scoped file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonFile {
    pub name: String,
    pub chunk: u32,
    pub last: bool,
    pub data: Vec<u8>,
}

impl Task {
    /// name of the file collecting the output of all commands
    pub fn stdout_file_name(&self) -> String {
        format!("{}_{}.out", self.cmd_id, self.index)
    }
}

impl TaskResult {
    pub fn output_file(&self, name: &str) -> Option<&ResultFile> {
        self.output_files.iter().find(|file| file.name == name)
    }
}

pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, MessageError> {
    bincode::serialize(message).map_err(MessageError::Encode)
}

pub fn decode<M: DeserializeOwned>(buffer: &[u8]) -> Result<M, MessageError> {
    bincode::deserialize(buffer).map_err(MessageError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_task_is_rejected() {
        let task = Task {
            job_id: 3,
            index: 0,
            cmd_id: String::from("lf"),
            init_job: true,
            completed_job_ids: vec![1, 2],
            input_files: vec![InputFile {
                name: String::from("network.xiidm.gz"),
                scope: Scope::Job,
                pre_processor: PreProcessor::FileGunzip,
                data: Some(vec![0; 16]),
            }],
            commands: Vec::new(),
            output_files: Vec::new(),
            env: Vec::new(),
        };
        let buffer = encode(&task).unwrap();

        assert_eq!(decode::<Task>(&buffer).unwrap(), task);
        assert!(matches!(
            decode::<Task>(&buffer[..buffer.len() / 2]),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn stdout_file_is_named_after_command_and_index() {
        let task = Task {
            job_id: 0,
            index: 12,
            cmd_id: String::from("dymola"),
            init_job: false,
            completed_job_ids: Vec::new(),
            input_files: Vec::new(),
            commands: Vec::new(),
            output_files: Vec::new(),
            env: Vec::new(),
        };

        assert_eq!(task.stdout_file_name(), "dymola_12.out");
    }
}
