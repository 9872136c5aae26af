//! Strongly-typed identifiers for build entities.
//!
//! Scheduler and target names are derived deterministically from project and
//! platform names; every lock and persisted-state key hangs off them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(BuildId, "bld");
define_id!(FiringId, "frg");

macro_rules! define_name {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

define_name!(SchedulerName);
define_name!(TargetName);

impl SchedulerName {
    /// Fires on source changes of the project branch.
    pub fn branch(project: &str) -> Self {
        Self(format!("branch-scheduler-{project}"))
    }

    /// Fires daily to build the last observed revision.
    pub fn nightly(project: &str) -> Self {
        Self(format!("nightly-scheduler-{project}"))
    }

    /// Fan-out node started by the fetch and nightly targets.
    pub fn build(project: &str) -> Self {
        Self(format!("build-scheduler-{project}"))
    }

    pub fn force_fetch(project: &str) -> Self {
        Self(format!("force-scheduler-{project}-fetch"))
    }

    pub fn force_build(project: &str) -> Self {
        Self(format!("force-scheduler-{project}-build"))
    }
}

impl TargetName {
    pub fn fetch(project: &str) -> Self {
        Self(format!("fetch-{project}"))
    }

    pub fn nightly(project: &str) -> Self {
        Self(format!("nightly-{project}"))
    }

    pub fn platform(project: &str, platform: &str) -> Self {
        Self(format!("{project}-{platform}"))
    }
}
