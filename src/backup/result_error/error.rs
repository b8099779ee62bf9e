use crate::backup::link::LinkError;
use crate::backup::pipeline::Stage;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error("Reading source {:?} failed:\n{}", path, indent::indent_all_with("  ", error.to_string()))]
    SourceRead { path: PathBuf, error: Box<Error> },
    #[error("Compression failed:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    Transform(Box<Error>),
    #[error("Provisioning bucket {:?} failed:\n{}", bucket, indent::indent_all_with("  ", error.to_string()))]
    Provisioning { bucket: String, error: Box<Error> },
    #[error("Uploading {:?} to bucket {:?} failed:\n{}", key, bucket, indent::indent_all_with("  ", error.to_string()))]
    Upload {
        bucket: String,
        key: String,
        error: Box<Error>,
    },
    #[error("Bucket {bucket:?} still missing after {attempts} existence checks")]
    BucketWaitTimeout { bucket: String, attempts: u32 },
    #[error("{} stage failed:\n{}", stage, indent::indent_all_with("  ", error.to_string()))]
    Stage { stage: Stage, error: Box<Error> },
    #[error("A pipeline stage exited without reporting its outcome")]
    StageLost,
    #[error("Snapshot command {command:?} failed ({status}):\n{}", indent::indent_all_with("  ", output))]
    Snapshot {
        command: String,
        status: String,
        output: String,
    },
    #[error("Pipeline cancelled")]
    Cancelled,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(
            errors
                .into_iter()
                .map(|e| e.into_iter())
                .flatten()
                .collect_vec(),
        )
    }
}

impl Error {
    pub fn source_read<P: Into<PathBuf>, E: Into<Error>>(path: P, error: E) -> Error {
        Error::SourceRead {
            path: path.into(),
            error: Box::new(error.into()),
        }
    }

    pub fn transform<E: Into<Error>>(error: E) -> Error {
        Error::Transform(Box::new(error.into()))
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().map(|e| e.into_iter()).flatten()),
            e => Box::new(std::iter::once(e)),
        }
    }

    /// Whether this error only reports that a neighbouring stage went away
    /// (aborted link, closed link, cancellation) rather than a failure of its own.
    pub fn is_secondary(&self) -> bool {
        match self {
            Error::Io(e) => is_link_error(e),
            Error::Cancelled => true,
            Error::SourceRead { error, .. }
            | Error::Transform(error)
            | Error::Provisioning { error, .. }
            | Error::Upload { error, .. }
            | Error::Stage { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.is_secondary(),
            Error::LotsOfError(v) => v.iter().all(Error::is_secondary),
            _ => false,
        }
    }
}

/// Looks for a [`LinkError`] anywhere in the chain, including inside nested io errors.
fn is_link_error(error: &(dyn std::error::Error + 'static)) -> bool {
    if error.is::<LinkError>() {
        return true;
    }
    if let Some(inner) = error
        .downcast_ref::<std::io::Error>()
        .and_then(std::io::Error::get_ref)
    {
        if is_link_error(inner) {
            return true;
        }
    }
    error.source().is_some_and(is_link_error)
}
