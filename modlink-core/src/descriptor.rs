//! Module identity, version and enforcement policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::DecodeError;

/// Layout revision this implementation writes for every extended record.
pub const LAYOUT_VERSION: i32 = 1;

/// Highest layout revision this implementation understands.
pub const MAX_SUPPORTED_LAYOUT: i32 = 1;

/// Wire value standing in for an absent patch component.
pub const NO_PATCH: i32 = -1;

/// Which side of a session a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Participant,
}

impl Role {
    /// The role on the other end of the connection.
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Participant,
            Role::Participant => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Participant => f.write_str("participant"),
        }
    }
}

/// Three-component version. `patch` is `None` when the module declares only major.minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModuleVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: Option<i32>,
}

impl ModuleVersion {
    pub const fn new(major: i32, minor: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            patch: Some(patch),
        }
    }

    pub const fn without_patch(major: i32, minor: i32) -> Self {
        Self {
            major,
            minor,
            patch: None,
        }
    }

    /// Build from wire fields; any negative patch means "absent".
    pub fn from_wire(major: i32, minor: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            patch: (patch >= 0).then_some(patch),
        }
    }

    pub fn patch_or_sentinel(&self) -> i32 {
        self.patch.unwrap_or(NO_PATCH)
    }

    /// Components truncated to `strictness` granularity. An absent patch counts as 0.
    pub(crate) fn truncated(&self, strictness: VersionStrictness) -> Vec<i32> {
        let full = [self.major, self.minor, self.patch.unwrap_or(0)];
        let n = match strictness {
            VersionStrictness::None => 0,
            VersionStrictness::Major => 1,
            VersionStrictness::Minor => 2,
            VersionStrictness::Patch => 3,
        };
        full[..n].to_vec()
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(p) => write!(f, "{}.{}.{}", self.major, self.minor, p),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version string {0:?}, expected major.minor[.patch]")]
pub struct ParseVersionError(String);

impl FromStr for ModuleVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(err());
        }
        let num = |p: &str| p.parse::<i32>().ok().filter(|n| *n >= 0).ok_or_else(err);
        let major = num(parts[0])?;
        let minor = num(parts[1])?;
        let patch = match parts.get(2) {
            Some(p) => Some(num(p)?),
            None => None,
        };
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

/// Who must run a module for a session to be allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementLevel {
    #[default]
    NotEnforced,
    EveryoneMustHave,
    /// A host running the module requires every participant to run it.
    ServerMustHave,
    /// A participant running the module requires the host to run it.
    ClientMustHave,
    /// Never required; versions are compared when both sides run it.
    VersionCheckOnly,
}

impl EnforcementLevel {
    /// Legacy wire value for "only check versions".
    const LEGACY_VERSION_CHECK_ONLY: i32 = 5;
    /// Legacy wire value for "no enforcement".
    const LEGACY_NOT_ENFORCED: i32 = 6;

    pub fn to_wire(self) -> i32 {
        match self {
            EnforcementLevel::NotEnforced => 0,
            EnforcementLevel::EveryoneMustHave => 1,
            EnforcementLevel::ServerMustHave => 2,
            EnforcementLevel::ClientMustHave => 3,
            EnforcementLevel::VersionCheckOnly => 4,
        }
    }

    /// Map a wire integer onto the canonical level, folding deprecated aliases.
    pub fn from_wire(value: i32) -> Result<Self, DecodeError> {
        match value {
            0 | Self::LEGACY_NOT_ENFORCED => Ok(EnforcementLevel::NotEnforced),
            1 => Ok(EnforcementLevel::EveryoneMustHave),
            2 => Ok(EnforcementLevel::ServerMustHave),
            3 => Ok(EnforcementLevel::ClientMustHave),
            4 | Self::LEGACY_VERSION_CHECK_ONLY => Ok(EnforcementLevel::VersionCheckOnly),
            other => Err(DecodeError::UnknownEnforcement(other)),
        }
    }
}

impl fmt::Display for EnforcementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnforcementLevel::NotEnforced => "not enforced",
            EnforcementLevel::EveryoneMustHave => "everyone must have",
            EnforcementLevel::ServerMustHave => "server must have",
            EnforcementLevel::ClientMustHave => "client must have",
            EnforcementLevel::VersionCheckOnly => "version check only",
        };
        f.write_str(s)
    }
}

/// Granularity at which version differences count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VersionStrictness {
    #[default]
    None,
    Major,
    Minor,
    Patch,
}

impl VersionStrictness {
    pub fn to_wire(self) -> i32 {
        match self {
            VersionStrictness::None => 0,
            VersionStrictness::Major => 1,
            VersionStrictness::Minor => 2,
            VersionStrictness::Patch => 3,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(VersionStrictness::None),
            1 => Ok(VersionStrictness::Major),
            2 => Ok(VersionStrictness::Minor),
            3 => Ok(VersionStrictness::Patch),
            other => Err(DecodeError::UnknownStrictness(other)),
        }
    }
}

impl fmt::Display for VersionStrictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionStrictness::None => "none",
            VersionStrictness::Major => "major",
            VersionStrictness::Minor => "minor",
            VersionStrictness::Patch => "patch",
        };
        f.write_str(s)
    }
}

/// One module as advertised by a peer. Peers match descriptors by `id` alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    id: String,
    name: String,
    version: ModuleVersion,
    enforcement: EnforcementLevel,
    strictness: VersionStrictness,
    layout_version: i32,
}

impl ModuleDescriptor {
    /// Descriptor at the current layout revision.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: ModuleVersion,
        enforcement: EnforcementLevel,
        strictness: VersionStrictness,
    ) -> Self {
        Self::from_record(id, name, version, enforcement, strictness, LAYOUT_VERSION)
    }

    /// Descriptor with an explicit layout revision, as read off the wire.
    pub fn from_record(
        id: impl Into<String>,
        name: impl Into<String>,
        version: ModuleVersion,
        enforcement: EnforcementLevel,
        strictness: VersionStrictness,
        layout_version: i32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
            enforcement,
            strictness,
            layout_version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> ModuleVersion {
        self.version
    }

    pub fn enforcement(&self) -> EnforcementLevel {
        self.enforcement
    }

    pub fn strictness(&self) -> VersionStrictness {
        self.strictness
    }

    pub fn layout_version(&self) -> i32 {
        self.layout_version
    }

    pub(crate) fn with_layout_version(mut self, layout_version: i32) -> Self {
        self.layout_version = layout_version;
        self
    }

    pub fn is_required_on_host(&self) -> bool {
        matches!(
            self.enforcement,
            EnforcementLevel::EveryoneMustHave | EnforcementLevel::ClientMustHave
        )
    }

    pub fn is_required_on_participant(&self) -> bool {
        matches!(
            self.enforcement,
            EnforcementLevel::EveryoneMustHave | EnforcementLevel::ServerMustHave
        )
    }

    pub fn is_required_on(&self, role: Role) -> bool {
        match role {
            Role::Host => self.is_required_on_host(),
            Role::Participant => self.is_required_on_participant(),
        }
    }

    pub fn is_unenforced(&self) -> bool {
        self.enforcement == EnforcementLevel::NotEnforced
    }

    pub fn is_version_check_only(&self) -> bool {
        self.enforcement == EnforcementLevel::VersionCheckOnly
    }

    /// True when presence on some role is mandatory.
    pub fn is_enforced(&self) -> bool {
        !self.is_unenforced() && !self.is_version_check_only()
    }
}
