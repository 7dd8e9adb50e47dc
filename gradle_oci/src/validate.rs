use crate::pipeline::PipelineError;
use lazy_regex::regex;

fn invalid(argument: &str, value: &str, description: &str) -> PipelineError {
    PipelineError::InvalidArgument {
        argument: argument.to_string(),
        value: value.to_string(),
        description: description.to_string(),
    }
}

/// Image tags, which java versions end up as too.
pub fn tag(argument: &str, value: &str) -> Result<(), PipelineError> {
    let tag = regex!("^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$");

    if value.is_empty() {
        return Err(invalid(argument, value, "cannot be empty"));
    }

    if !tag.is_match(value) {
        return Err(invalid(
            argument,
            value,
            "must start with an alphanumeric or underscore, contain only alphanumerics, '_', '.' and '-' \
             and be at most 128 characters",
        ));
    }

    Ok(())
}

pub fn registry_host(argument: &str, value: &str) -> Result<(), PipelineError> {
    let host = regex!(r"^[a-zA-Z0-9]([a-zA-Z0-9.-]*[a-zA-Z0-9])?(:[0-9]{1,5})?$");

    if !host.is_match(value) {
        return Err(invalid(
            argument,
            value,
            "must be a hostname with an optional port (eg: docker.io, localhost:5000)",
        ));
    }

    Ok(())
}

/// A '/' separated list of lowercase path components.
pub fn repository(argument: &str, value: &str) -> Result<(), PipelineError> {
    let component = regex!(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*$");

    if value.is_empty() {
        return Err(invalid(argument, value, "cannot be empty"));
    }

    if !value.split('/').all(|part| component.is_match(part)) {
        return Err(invalid(
            argument,
            value,
            "can only be made up of lowercase alphanumerics separated by '.', '_', '__' or '-'",
        ));
    }

    Ok(())
}

/// A single path component; image names cannot nest.
pub fn image_name(argument: &str, value: &str) -> Result<(), PipelineError> {
    if value.contains('/') {
        return Err(invalid(argument, value, "cannot contain '/'"));
    }

    repository(argument, value)
}

pub fn gradle_task(argument: &str, value: &str) -> Result<(), PipelineError> {
    if value.is_empty() {
        return Err(invalid(argument, value, "cannot be empty"));
    }

    if value.chars().any(char::is_whitespace) {
        return Err(invalid(
            argument,
            value,
            "must be a single task name without whitespace",
        ));
    }

    Ok(())
}

pub fn not_empty(argument: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(invalid(argument, value, "cannot be empty"));
    }

    Ok(())
}
