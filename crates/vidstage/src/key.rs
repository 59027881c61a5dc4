use std::fmt;
use std::path::{Path, PathBuf};
use crate::error::{JobError, JobResult};

/// Composite job identity: `(namespace, fileId)`.
///
/// Every component becomes exactly one directory name under the store's base,
/// so each is validated as a single safe path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    namespace: Vec<String>,
    file_id: String,
}

impl JobKey {
    pub fn new<S: AsRef<str>>(namespace: &[S], file_id: &str) -> JobResult<Self> {
        let namespace: Vec<String> = namespace.iter().map(|s| s.as_ref().to_string()).collect();
        if namespace.is_empty() {
            return Err(JobError::InvalidKey("namespace must have at least one segment".to_string()));
        }
        for segment in &namespace {
            validate_segment(segment)?;
        }
        validate_segment(file_id)?;

        Ok(JobKey {
            namespace,
            file_id: file_id.to_string(),
        })
    }

    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// `<base>/<namespace...>/<fileId>`
    pub fn dir_under(&self, base: &Path) -> PathBuf {
        namespace_dir(base, &self.namespace).join(&self.file_id)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.join("/"), self.file_id)
    }
}

/// Validate a namespace on its own (used by scans that take no fileId)
pub fn validate_namespace<S: AsRef<str>>(namespace: &[S]) -> JobResult<Vec<String>> {
    if namespace.is_empty() {
        return Err(JobError::InvalidKey("namespace must have at least one segment".to_string()));
    }
    namespace
        .iter()
        .map(|s| validate_segment(s.as_ref()).map(|_| s.as_ref().to_string()))
        .collect()
}

/// Parse the `a/b/c` form used on the command line
pub fn parse_namespace(raw: &str) -> JobResult<Vec<String>> {
    let parts: Vec<&str> = raw.split('/').filter(|p| !p.is_empty()).collect();
    validate_namespace(&parts)
}

pub(crate) fn namespace_dir<S: AsRef<str>>(base: &Path, namespace: &[S]) -> PathBuf {
    let mut dir = base.to_path_buf();
    for segment in namespace {
        dir.push(segment.as_ref());
    }
    dir
}

fn validate_segment(segment: &str) -> JobResult<()> {
    if segment.is_empty() {
        return Err(JobError::InvalidKey("empty path segment".to_string()));
    }
    // Dot-prefixed names are reserved for the lock and partial artefacts
    if segment.starts_with('.') {
        return Err(JobError::InvalidKey(format!("segment '{segment}' may not start with '.'")));
    }
    if segment.chars().any(|c| c == '/' || c == '\\' || c == '\0') {
        return Err(JobError::InvalidKey(format!("segment '{segment}' contains a path separator")));
    }
    Ok(())
}
