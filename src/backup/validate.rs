//! Validation functions for configuration values.
//!
//! Provides custom validation functions for directories, executables,
//! bucket names and regions.

use validator::ValidationError;

use std::path::Path;

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_file_exist<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ValidationError::new("InvalidFile")
            .with_message(format!("{:?} is not an existing file", path).into()));
    }

    Ok(())
}

/// S3 bucket naming rules: 3-63 characters of lowercase letters, digits, dots and
/// hyphens, starting and ending with a letter or digit, no consecutive dots.
pub fn validate_bucket_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    let invalid = |reason: &str| {
        Err(ValidationError::new("InvalidBucketName")
            .with_message(format!("Invalid bucket name {name:?}: {reason}").into()))
    };

    if !(3..=63).contains(&name.len()) {
        return invalid("length must be between 3 and 63");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return invalid("only lowercase letters, digits, '.' and '-' are allowed");
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return invalid("must start and end with a letter or digit");
    }
    if name.contains("..") {
        return invalid("must not contain consecutive dots");
    }

    Ok(())
}

pub fn validate_region<S: AsRef<str>>(region: S) -> Result<(), ValidationError> {
    let region = region.as_ref();
    if region.is_empty() || region.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("InvalidRegion")
            .with_message(format!("Invalid region {region:?}").into()));
    }

    Ok(())
}
