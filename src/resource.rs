use std::fmt;
use std::str::FromStr;

use crate::Error;

/// The resource name of a Cloud Spanner database.
///
/// Formats as `projects/<project>/instances/<instance>/databases/<database>`,
/// which is the identifier every session RPC addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseId {
    project: String,
    instance: String,
    database: String,
}

impl DatabaseId {
    pub fn new(
        project: impl Into<String>,
        instance: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            database: database.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project, self.instance, self.database
        )
    }
}

impl FromStr for DatabaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "instances", instance, "databases", database]
                if !project.is_empty() && !instance.is_empty() && !database.is_empty() =>
            {
                Ok(DatabaseId::new(*project, *instance, *database))
            }
            _ => Err(Error::InvalidConfig(format!(
                "invalid database resource name: {s}"
            ))),
        }
    }
}
