//! Domain models for runs, replicas, and dispatchable jobs.
//!
//! # Design
//! - Plain data carriers; validation of hosts happens in `hosts.rs`.
//! - Jobs carry only the positional arguments the queue transmits.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{CoreError, CoreResult};

/// One recorded data-collection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique run identifier.
    pub basename: String,
    /// Acquisition timestamp of the run.
    pub datetime: DateTime<Utc>,
    /// Known replicas in the order they were recorded.
    #[serde(default)]
    pub raw: Vec<RawLocation>,
}

impl Run {
    /// Construct a run without any replicas.
    #[must_use]
    pub fn new(basename: impl Into<String>, datetime: DateTime<Utc>) -> Self {
        Self {
            basename: basename.into(),
            datetime,
            raw: Vec::new(),
        }
    }

    /// Append a replica unless the same `(host, path)` pair is already recorded.
    ///
    /// Returns `false` when the location was a duplicate.
    pub fn push_location(&mut self, location: RawLocation) -> bool {
        let duplicate = self
            .raw
            .iter()
            .any(|existing| existing.host == location.host && existing.path == location.path);
        if duplicate {
            return false;
        }
        self.raw.push(location);
        true
    }

    /// Host names of all replicas, in recorded order.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.raw.iter().map(|location| location.host.as_str()).collect()
    }
}

/// One physical copy of a run's raw data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLocation {
    /// Host holding the copy.
    pub host: String,
    /// Storage path or object key on that host.
    pub path: String,
    /// Archive container format of the copy.
    #[serde(default)]
    pub format: ArchiveFormat,
}

impl RawLocation {
    /// Convenience constructor.
    #[must_use]
    pub fn new(host: impl Into<String>, path: impl Into<String>, format: ArchiveFormat) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            format,
        }
    }
}

/// Archive container formats a replica may be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Gzip-compressed tarball.
    #[serde(rename = "tar.gz")]
    TarGz,
    /// Uncompressed tarball.
    Tar,
    /// Zip archive.
    Zip,
    /// 7-Zip archive as produced by the capture hosts.
    #[serde(rename = "7z")]
    SevenZip,
    /// Format was not recorded.
    #[default]
    Unknown,
}

impl ArchiveFormat {
    /// Tag stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::SevenZip => "7z",
            Self::Unknown => "unknown",
        }
    }

    /// Guess the format from a file name's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".7z") {
            Self::SevenZip
        } else {
            Self::Unknown
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            "tar" => Ok(Self::Tar),
            "zip" => Ok(Self::Zip),
            "7z" => Ok(Self::SevenZip),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(CoreError::collaborator(
                "archive_format.parse",
                format!("unrecognised archive format tag '{other}'"),
            )),
        }
    }
}

impl Display for ArchiveFormat {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Kinds of work the queue knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Copy or repackage a run onto a destination host.
    Relocate,
    /// Run the processing runtime over a materialised input.
    Process,
}

impl TaskKind {
    /// Registered task name; routing patterns match against it.
    #[must_use]
    pub const fn task_name(self) -> &'static str {
        match self {
            Self::Relocate => "relocation.relocate",
            Self::Process => "postprocess.process",
        }
    }

    /// Reverse lookup from a registered task name.
    #[must_use]
    pub fn from_task_name(name: &str) -> Option<Self> {
        [Self::Relocate, Self::Process]
            .into_iter()
            .find(|kind| kind.task_name() == name)
    }
}

/// Positional arguments carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobArgs {
    /// Relocation of a run onto `destination`.
    Relocate {
        /// Run to relocate.
        basename: String,
        /// Validated destination host name.
        destination: String,
    },
    /// Processing of `input` into `output`.
    Process {
        /// Where the raw data comes from.
        input: InputReference,
        /// Where derived products go.
        output: OutputTarget,
    },
}

/// Immutable unit of work submitted to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Task type.
    pub kind: TaskKind,
    /// Task arguments.
    pub args: JobArgs,
}

impl Job {
    /// Relocation job for `basename` onto `destination`.
    #[must_use]
    pub fn relocate(basename: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Relocate,
            args: JobArgs::Relocate {
                basename: basename.into(),
                destination: destination.into(),
            },
        }
    }

    /// Processing job from `input` to `output`.
    #[must_use]
    pub const fn process(input: InputReference, output: OutputTarget) -> Self {
        Self {
            kind: TaskKind::Process,
            args: JobArgs::Process { input, output },
        }
    }

    /// Positional wire arguments.
    #[must_use]
    pub fn positional_args(&self) -> Vec<Value> {
        match &self.args {
            JobArgs::Relocate {
                basename,
                destination,
            } => vec![
                Value::String(basename.clone()),
                Value::String(destination.clone()),
            ],
            JobArgs::Process { input, output } => vec![
                Value::String(input.to_string()),
                Value::String(output.to_string()),
            ],
        }
    }

    /// Rebuild a job from its task name and positional wire arguments.
    ///
    /// # Errors
    ///
    /// Returns an error when the task name is unknown or the arguments are malformed.
    pub fn from_positional(task: &str, args: &[Value]) -> CoreResult<Self> {
        let kind = TaskKind::from_task_name(task).ok_or_else(|| {
            CoreError::collaborator("job.from_positional", format!("unknown task '{task}'"))
        })?;
        let strings = args
            .iter()
            .map(|value| {
                value.as_str().map(str::to_string).ok_or_else(|| {
                    CoreError::collaborator("job.from_positional", "arguments must be strings")
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let [first, second] = strings.as_slice() else {
            return Err(CoreError::collaborator(
                "job.from_positional",
                format!("task '{task}' expects two arguments, got {}", strings.len()),
            ));
        };
        match kind {
            TaskKind::Relocate => Ok(Self::relocate(first.clone(), second.clone())),
            TaskKind::Process => Ok(Self::process(first.parse()?, second.parse()?)),
        }
    }

    /// Run basename the job refers to, when it has one.
    #[must_use]
    pub fn basename(&self) -> Option<&str> {
        match &self.args {
            JobArgs::Relocate { basename, .. } => Some(basename),
            JobArgs::Process {
                input: InputReference::Catalog { basename },
                ..
            } => Some(basename),
            JobArgs::Process { .. } => None,
        }
    }
}

/// Logical input reference accepted by the processing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum InputReference {
    /// Archive on the local filesystem.
    Local {
        /// Path to the archive, relative paths resolve against the working directory.
        path: PathBuf,
    },
    /// Archive stored in the raw-data object store.
    ObjectStore {
        /// Bucket name.
        bucket: String,
        /// Object key within the bucket.
        key: String,
    },
    /// Run tracked by the catalog.
    Catalog {
        /// Run basename.
        basename: String,
    },
}

impl FromStr for InputReference {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((scheme, _)) = value.split_once("://") else {
            return Ok(Self::Local {
                path: PathBuf::from(value),
            });
        };
        let url = Url::parse(value).map_err(|err| CoreError::collaborator("input.parse", err))?;
        match scheme {
            "file" => Ok(Self::Local {
                path: PathBuf::from(url.path()),
            }),
            "s3" => {
                let (bucket, key) = bucket_and_key(&url, "input.parse")?;
                if key.is_empty() {
                    return Err(CoreError::collaborator(
                        "input.parse",
                        format!("object-store input '{value}' has no key"),
                    ));
                }
                Ok(Self::ObjectStore { bucket, key })
            }
            "db" => {
                let basename = url
                    .host_str()
                    .map(str::to_string)
                    .filter(|host| !host.is_empty())
                    .unwrap_or_else(|| url.path().trim_matches('/').to_string());
                if basename.is_empty() {
                    return Err(CoreError::collaborator(
                        "input.parse",
                        format!("catalog input '{value}' has no basename"),
                    ));
                }
                Ok(Self::Catalog { basename })
            }
            other => Err(CoreError::collaborator(
                "input.parse",
                format!("unsupported input scheme '{other}'"),
            )),
        }
    }
}

impl Display for InputReference {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(formatter, "{}", path.display()),
            Self::ObjectStore { bucket, key } => write!(formatter, "s3://{bucket}/{key}"),
            Self::Catalog { basename } => write!(formatter, "db://{basename}"),
        }
    }
}

/// Destination for derived products written by the processing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum OutputTarget {
    /// Directory on the worker's filesystem.
    Local {
        /// Output directory.
        path: PathBuf,
    },
    /// Bucket and key prefix in the output object store.
    ObjectStore {
        /// Bucket name.
        bucket: String,
        /// Key prefix under which outputs are written.
        prefix: String,
    },
}

impl FromStr for OutputTarget {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((scheme, _)) = value.split_once("://") else {
            return Ok(Self::Local {
                path: PathBuf::from(value),
            });
        };
        let url = Url::parse(value).map_err(|err| CoreError::collaborator("output.parse", err))?;
        match scheme {
            "file" => Ok(Self::Local {
                path: PathBuf::from(url.path()),
            }),
            "s3" => {
                let (bucket, prefix) = bucket_and_key(&url, "output.parse")?;
                Ok(Self::ObjectStore { bucket, prefix })
            }
            other => Err(CoreError::collaborator(
                "output.parse",
                format!("unsupported output scheme '{other}'"),
            )),
        }
    }
}

impl Display for OutputTarget {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(formatter, "{}", path.display()),
            Self::ObjectStore { bucket, prefix } if prefix.is_empty() => {
                write!(formatter, "s3://{bucket}")
            }
            Self::ObjectStore { bucket, prefix } => write!(formatter, "s3://{bucket}/{prefix}"),
        }
    }
}

fn bucket_and_key(url: &Url, operation: &'static str) -> CoreResult<(String, String)> {
    let bucket = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| CoreError::collaborator(operation, format!("'{url}' has no bucket")))?;
    let key = url.path().trim_start_matches('/').to_string();
    Ok((bucket.to_string(), key))
}
