//! Static bearer tokens loaded from a CSV file.

use crate::LocalError;
use async_trait::async_trait;
use broker_auth_core::{AuthOutcome, TokenAuthenticator, User};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Splits one CSV record. Fields may be double-quoted; `""` inside quotes is
/// a literal quote. Leading spaces before a field are ignored.
fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }

        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => return Err("unterminated quoted field".to_string()),
                }
            }
            match chars.next() {
                None => {
                    fields.push(field);
                    return Ok(fields);
                }
                Some(',') => {}
                Some(c) => return Err(format!("unexpected {c:?} after quoted field")),
            }
        } else {
            loop {
                match chars.next() {
                    Some(',') => break,
                    Some(c) => field.push(c),
                    None => {
                        fields.push(field);
                        return Ok(fields);
                    }
                }
            }
        }
        fields.push(field);
    }
}

/// Authenticates tokens listed in a file of `token,user,uid[,"group1,group2"]`
/// records.
///
/// The file enumerates broker users directly, so no identity mapping happens.
/// Tokens match exactly and case-sensitively.
#[derive(Debug, Clone, Default)]
pub struct TokenFileAuthenticator {
    tokens: HashMap<String, User>,
}

impl TokenFileAuthenticator {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LocalError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| LocalError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let authenticator = Self::parse(path, &contents)?;
        info!(path = %path.display(), tokens = authenticator.tokens.len(), "loaded token file");
        Ok(authenticator)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, LocalError> {
        let parse_error = |line: usize, message: String| LocalError::Parse {
            path: path.to_path_buf(),
            line,
            message,
        };

        let mut tokens = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let record = split_record(line).map_err(|message| parse_error(index + 1, message))?;
            if record.len() < 3 {
                return Err(parse_error(
                    index + 1,
                    format!("expected at least 3 columns, found {}", record.len()),
                ));
            }

            let mut user = User::new(&record[1], &record[2]);
            if let Some(groups) = record.get(3) {
                user = user.with_groups(
                    groups
                        .split(',')
                        .map(str::trim)
                        .filter(|group| !group.is_empty()),
                );
            }
            tokens.insert(record[0].clone(), user);
        }
        Ok(Self { tokens })
    }
}

#[async_trait]
impl TokenAuthenticator for TokenFileAuthenticator {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        Ok(self.tokens.get(token).cloned())
    }
}
