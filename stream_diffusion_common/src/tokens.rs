use std::{env, fs, path::Path, str::FromStr};

use thiserror::Error;

/// Where to source the Hugging Face token from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// A literal token value.
    Literal(String),
    /// Read the token from an environment variable.
    EnvVar(String),
    /// Read the token from a file.
    Path(String),
    /// Use the token at `~/.cache/huggingface/token`, if present.
    CacheToken,
    /// Do not send a token.
    None,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unknown token source `{0}`, expected one of `literal:<value>`, `env:<var>`, `path:<file>`, `cache`, `none`")]
    UnknownSource(String),
    #[error("environment variable `{0}` is not set")]
    EnvVarNotSet(String),
    #[error("could not read token file: {0}")]
    Io(#[from] std::io::Error),
}

impl FromStr for TokenSource {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(2, ':').collect();
        match parts[0] {
            "literal" if parts.len() == 2 => Ok(Self::Literal(parts[1].to_string())),
            "env" if parts.len() == 2 => Ok(Self::EnvVar(parts[1].to_string())),
            "path" if parts.len() == 2 => Ok(Self::Path(parts[1].to_string())),
            "cache" => Ok(Self::CacheToken),
            "none" => Ok(Self::None),
            _ => Err(TokenError::UnknownSource(s.to_string())),
        }
    }
}

/// Resolve a token source to an optional token value.
pub fn get_token(source: &TokenSource) -> Result<Option<String>, TokenError> {
    let token = match source {
        TokenSource::Literal(value) => Some(value.clone()),
        TokenSource::EnvVar(var) => Some(
            env::var(var).map_err(|_| TokenError::EnvVarNotSet(var.clone()))?,
        ),
        TokenSource::Path(file) => Some(fs::read_to_string(file)?),
        TokenSource::CacheToken => {
            let path = dirs::home_dir()
                .map(|home| home.join(".cache").join("huggingface").join("token"));
            match path {
                Some(path) if Path::new(&path).exists() => Some(fs::read_to_string(path)?),
                _ => None,
            }
        }
        TokenSource::None => None,
    };

    Ok(token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_token_sources() {
        assert_eq!(
            "literal:hf_abc".parse::<TokenSource>().unwrap(),
            TokenSource::Literal("hf_abc".to_string())
        );
        assert_eq!(
            "env:HF_TOKEN".parse::<TokenSource>().unwrap(),
            TokenSource::EnvVar("HF_TOKEN".to_string())
        );
        assert_eq!(
            "path:/tmp/token".parse::<TokenSource>().unwrap(),
            TokenSource::Path("/tmp/token".to_string())
        );
        assert_eq!("cache".parse::<TokenSource>().unwrap(), TokenSource::CacheToken);
        assert_eq!("none".parse::<TokenSource>().unwrap(), TokenSource::None);
        assert!("bogus".parse::<TokenSource>().is_err());
    }

    #[test]
    fn literal_token_is_trimmed() {
        let token = get_token(&TokenSource::Literal(" hf_abc\n".to_string())).unwrap();
        assert_eq!(token, Some("hf_abc".to_string()));
    }

    #[test]
    fn empty_literal_token_is_none() {
        let token = get_token(&TokenSource::Literal(String::new())).unwrap();
        assert_eq!(token, None);
    }
}
