use crate::{
    messages::{CommonFile, InputFile, JobId, PreProcessor},
    transport::Rank,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ignore::WalkBuilder;
use parking_lot::Mutex;
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Cursor, Read, Write},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

pub const COMMON_DIR_PREFIX: &str = "itools_common_";
pub const WORKING_DIR_PREFIX: &str = "itools_work_";
pub const JOB_DIR_PREFIX: &str = "itools_job_";
const EXPLODED_SUFFIX: &str = ".exploded";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid zip archive {path:?}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Data is expected for input file '{0}'")]
    MissingData(String),
    #[error("{0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),
    #[error("Invalid chunk {chunk} of run scoped file '{name}'")]
    InvalidChunk { name: String, chunk: u32 },
}

/// attach the offending path to an io::Error
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, StagingError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StagingError> {
        self.map_err(|source| StagingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn common_dir(local_dir: &Path, rank: Rank) -> PathBuf {
    local_dir.join(format!("{COMMON_DIR_PREFIX}{rank}"))
}

pub fn working_dir(local_dir: &Path, rank: Rank, thread: usize) -> PathBuf {
    local_dir.join(format!("{WORKING_DIR_PREFIX}{rank}_{thread}"))
}

pub fn job_dir(local_dir: &Path, rank: Rank, job_id: JobId) -> PathBuf {
    local_dir.join(format!("{JOB_DIR_PREFIX}{rank}_{job_id}"))
}

/// remove `dir` (if present) and create it again empty
pub fn recreate_dir(dir: &Path) -> Result<(), StagingError> {
    remove_dir(dir)?;
    fs::create_dir(dir).at(dir)
}

/// remove `dir` recursively, a missing directory is not an error
pub fn remove_dir(dir: &Path) -> Result<(), StagingError> {
    match fs::remove_dir_all(dir) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(StagingError::Io {
            path: dir.to_path_buf(),
            source: error,
        }),
        _ => Ok(()),
    }
}

/// remove everything inside `dir` but keep the directory itself
pub fn clean_dir(dir: &Path) -> Result<(), StagingError> {
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();

        if fs::symlink_metadata(&path).at(&path)?.is_dir() {
            fs::remove_dir_all(&path).at(&path)?;
        } else {
            fs::remove_file(&path).at(&path)?;
        }
    }

    Ok(())
}

/// total size of the regular files below `dir`, symbolic links are not followed
pub fn dir_size(dir: &Path) -> u64 {
    WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

fn gunzip_name(name: &str) -> &str {
    name.strip_suffix(".gz").unwrap_or(name)
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), StagingError> {
    fs::write(path, data).at(path)
}

fn gunzip_to(reader: impl Read, target: &Path) -> Result<(), StagingError> {
    let mut decoder = GzDecoder::new(reader);
    let mut output = BufWriter::new(File::create(target).at(target)?);

    io::copy(&mut decoder, &mut output).at(target)?;
    output.flush().at(target)
}

fn unzip_to(reader: impl Read + io::Seek, dir: &Path, origin: &Path) -> Result<(), StagingError> {
    zip::ZipArchive::new(reader)
        .and_then(|mut archive| archive.extract(dir))
        .map_err(|source| StagingError::Zip {
            path: origin.to_path_buf(),
            source,
        })
}

/// materialize an input file carried by the message into `dir`
pub fn write_input_file(input_file: &InputFile, dir: &Path) -> Result<(), StagingError> {
    let data = input_file
        .data
        .as_deref()
        .ok_or_else(|| StagingError::MissingData(input_file.name.clone()))?;

    match input_file.pre_processor {
        PreProcessor::None => write_file(&dir.join(&input_file.name), data),
        PreProcessor::ArchiveUnzip => unzip_to(Cursor::new(data), dir, &dir.join(&input_file.name)),
        PreProcessor::FileGunzip => gunzip_to(data, &dir.join(gunzip_name(&input_file.name))),
    }
}

/// store an input file as received, pre-processing is deferred until it gets linked
pub fn store_input_file(input_file: &InputFile, dir: &Path) -> Result<PathBuf, StagingError> {
    let data = input_file
        .data
        .as_deref()
        .ok_or_else(|| StagingError::MissingData(input_file.name.clone()))?;
    let path = dir.join(&input_file.name);

    write_file(&path, data)?;

    Ok(path)
}

pub fn exploded_archive_dir(archive_file: &Path) -> PathBuf {
    let mut name = archive_file
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(EXPLODED_SUFFIX);

    archive_file.with_file_name(name)
}

fn explode_archive(pre_processor: PreProcessor, archive_file: &Path) -> Result<(), StagingError> {
    let exploded_dir = exploded_archive_dir(archive_file);

    // a partially exploded directory is never left behind under the lock
    recreate_dir(&exploded_dir)?;

    let reader = BufReader::new(File::open(archive_file).at(archive_file)?);
    match pre_processor {
        PreProcessor::None => Ok(()),
        PreProcessor::ArchiveUnzip => unzip_to(reader, &exploded_dir, archive_file),
        PreProcessor::FileGunzip => {
            let name = archive_file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            gunzip_to(reader, &exploded_dir.join(gunzip_name(&name)))
        }
    }
}

/// Links a run or job scoped file into a working directory
///
/// Archives are exploded once next to the original file, guarded by `explode_lock` as several
/// worker threads of a rank share the same common and job directories. Every member of the
/// exploded archive gets its own link.
pub fn link_input_file(
    pre_processor: PreProcessor,
    file: &Path,
    dir: &Path,
    explode_lock: &Mutex<()>,
) -> Result<(), StagingError> {
    if !dir.is_dir() {
        return Err(StagingError::NotADirectory(dir.to_path_buf()));
    }

    let link = |target: &Path| -> Result<(), StagingError> {
        let name = target.file_name().unwrap_or_default();
        trace!(target = ?target, "linking input file");

        symlink(target, dir.join(name)).at(target)
    };

    match pre_processor {
        PreProcessor::None => link(file),
        PreProcessor::ArchiveUnzip | PreProcessor::FileGunzip => {
            let exploded_dir = exploded_archive_dir(file);
            {
                let _guard = explode_lock.lock();

                if !exploded_dir.is_dir() {
                    debug!(archive = ?file, "exploding archive");
                    explode_archive(pre_processor, file)?;
                }
            }

            for entry in fs::read_dir(&exploded_dir).at(&exploded_dir)? {
                link(&entry.at(&exploded_dir)?.path())?;
            }

            Ok(())
        }
    }
}

pub fn chunk_file_name(name: &str, chunk: u32) -> String {
    format!("{name}.chunk{chunk}")
}

/// Store one chunk of a run scoped file in the common directory
///
/// On the last chunk all chunks are concatenated into the final file and removed, returning the
/// path of the assembled file.
pub fn write_common_file_chunk(
    common_dir: &Path,
    common_file: &CommonFile,
) -> Result<Option<PathBuf>, StagingError> {
    if common_file.name.is_empty() || common_file.name.contains('/') {
        return Err(StagingError::InvalidChunk {
            name: common_file.name.clone(),
            chunk: common_file.chunk,
        });
    }

    let chunk_path = common_dir.join(chunk_file_name(&common_file.name, common_file.chunk));
    write_file(&chunk_path, &common_file.data)?;

    if !common_file.last {
        return Ok(None);
    }

    let path = common_dir.join(&common_file.name);
    // a newer version of the file invalidates a previously exploded archive
    remove_dir(&exploded_archive_dir(&path))?;

    let mut output = BufWriter::new(File::create(&path).at(&path)?);
    for chunk in 0..=common_file.chunk {
        let chunk_path = common_dir.join(chunk_file_name(&common_file.name, chunk));
        let mut input = File::open(&chunk_path).map_err(|_| StagingError::InvalidChunk {
            name: common_file.name.clone(),
            chunk,
        })?;

        io::copy(&mut input, &mut output).at(&path)?;
        fs::remove_file(&chunk_path).at(&chunk_path)?;
    }
    output.flush().at(&path)?;

    Ok(Some(path))
}

/// gzip the content of `path` in memory
pub fn gzip_file(path: &Path) -> Result<Vec<u8>, StagingError> {
    let mut input = File::open(path).at(path)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    io::copy(&mut input, &mut encoder).at(path)?;
    encoder.finish().at(path)
}

/// Zip the content of `dir` into `zip_file`, entries are rooted at `root_name`
///
/// Symbolic links are followed so linked run and job scoped files are archived with their
/// content.
pub fn zip_dir(dir: &Path, zip_file: &Path, root_name: &str) -> Result<(), StagingError> {
    let zip_error = |source| StagingError::Zip {
        path: zip_file.to_path_buf(),
        source,
    };
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);
    let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(zip_file).at(zip_file)?));

    writer
        .add_directory(format!("{root_name}/"), options)
        .map_err(zip_error)?;

    let entries = WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(false)
        .follow_links(true)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.depth() > 0);

    for entry in entries {
        let relative = match entry.path().strip_prefix(dir) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        let name = format!("{root_name}/{relative}");

        if entry.file_type().map_or(false, |kind| kind.is_dir()) {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(zip_error)?;
        } else {
            writer.start_file(name, options).map_err(zip_error)?;
            let mut input = File::open(entry.path()).at(entry.path())?;
            io::copy(&mut input, &mut writer).at(entry.path())?;
        }
    }

    writer
        .finish()
        .map_err(zip_error)?
        .flush()
        .at(zip_file)
}

/// (available, capacity) of the file system holding `path`, in bytes
pub fn space(path: &Path) -> Result<(u64, u64), StagingError> {
    let stats = nix::sys::statvfs::statvfs(path).map_err(|errno| StagingError::Io {
        path: path.to_path_buf(),
        source: io::Error::from(errno),
    })?;
    let fragment = stats.fragment_size() as u64;

    Ok((
        stats.blocks_available() as u64 * fragment,
        stats.blocks() as u64 * fragment,
    ))
}
