use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SecretError {
    #[error("invalid secret reference '{0}'; must be one of 'env:NAME', 'file:PATH' or '@' to read stdin")]
    InvalidReference(String),

    #[error("secret source not found; {0}")]
    NotFound(String),

    #[error("could not read secret; {0}")]
    Read(String),

    #[error("secret resolved to an empty value")]
    Empty,
}

/// A reference to sensitive credential material.
///
/// The reference itself is safe to log and pass around. The value behind it is only read when [`Secret::resolve`]
/// is called, which should happen at the point the credential is actually used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Secret {
    /// Read from an environment variable.
    Env(String),

    /// Read from a file; a single trailing newline is removed.
    File(PathBuf),

    /// Read from stdin.
    Stdin,
}

impl FromStr for Secret {
    type Err = SecretError;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        if reference == "@" {
            return Ok(Secret::Stdin);
        }

        match reference.split_once(':') {
            Some(("env", name)) if !name.is_empty() => Ok(Secret::Env(name.to_string())),
            Some(("file", path)) if !path.is_empty() => Ok(Secret::File(PathBuf::from(path))),
            _ => Err(SecretError::InvalidReference(reference.to_string())),
        }
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Env(name) => write!(f, "env:{name}"),
            Secret::File(path) => write!(f, "file:{}", path.to_string_lossy()),
            Secret::Stdin => write!(f, "@"),
        }
    }
}

impl Secret {
    pub fn resolve(&self) -> Result<SecretValue, SecretError> {
        let value = match self {
            Secret::Env(name) => std::env::var(name)
                .map_err(|e| SecretError::NotFound(format!("environment variable '{name}'; {e}")))?,
            Secret::File(path) => {
                let mut contents = std::fs::read_to_string(path).map_err(|e| {
                    SecretError::NotFound(format!("file '{}'; {}", path.to_string_lossy(), e))
                })?;

                if contents.ends_with('\n') {
                    contents.pop();
                    if contents.ends_with('\r') {
                        contents.pop();
                    }
                }

                contents
            }
            Secret::Stdin => {
                let mut contents = String::new();
                std::io::stdin()
                    .read_to_string(&mut contents)
                    .map_err(|e| SecretError::Read(e.to_string()))?;

                contents.trim_end_matches(['\r', '\n']).to_string()
            }
        };

        if value.is_empty() {
            return Err(SecretError::Empty);
        }

        Ok(SecretValue(value))
    }
}

/// Resolved credential material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue([REDACTED])")
    }
}
