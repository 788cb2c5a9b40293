use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Which device a signaling connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The desktop browser running the exam.
    Primary,
    /// The phone providing the side camera.
    Secondary,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-scoped signaling address, `/{role}/{task}/{session}/{user}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointPath {
    role: Role,
    task_id: String,
    session_id: String,
    user_id: String,
}

impl EndpointPath {
    pub fn new(
        role: Role,
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self, WireError> {
        let task_id = non_empty(task_id.into(), "task id")?;
        let session_id = non_empty(session_id.into(), "session id")?;
        let user_id = non_empty(user_id.into(), "user id")?;
        Ok(Self {
            role,
            task_id,
            session_id,
            user_id,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Path segments in order, unescaped.
    pub fn segments(&self) -> [&str; 4] {
        [
            self.role.as_str(),
            &self.task_id,
            &self.session_id,
            &self.user_id,
        ]
    }

    /// Same session, other device.
    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in self.segments() {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

fn non_empty(value: String, field: &'static str) -> Result<String, WireError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WireError::EmptyIdentifier(field));
    }
    Ok(trimmed.to_string())
}
