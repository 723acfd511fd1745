use crate::error::{Result, SupervisorError};
use crate::fs::FileSystem;
use nix::unistd::{getegid, geteuid, Group, User};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

const ROOT: &str = "root";

/// The identity a plugin runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAs {
    /// No identity requested; the plugin runs as the supervisor does.
    Inherit,
    /// A named user with an optional explicit group.
    Named { user: String, group: Option<String> },
}

impl RunAs {
    pub fn user(&self) -> Option<&str> {
        match self {
            RunAs::Inherit => None,
            RunAs::Named { user, .. } => Some(user),
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            RunAs::Inherit => None,
            RunAs::Named { group, .. } => group.as_deref(),
        }
    }
}

impl FromStr for RunAs {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(RunAs::Inherit);
        }

        let (user, group) = match s.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (s, None),
        };
        if user.is_empty() || group.is_some_and(|g| g.is_empty() || g.contains(':')) {
            return Err(SupervisorError::InvalidIdentity(s.to_string()));
        }

        Ok(RunAs::Named {
            user: user.to_string(),
            group: group.map(str::to_string),
        })
    }
}

pub trait IdentityResolver: Send + Sync {
    /// uid and primary gid of a user.
    fn lookup_user(&self, user: &str) -> Option<(u32, u32)>;

    fn lookup_group(&self, group: &str) -> Option<u32>;

    /// uid/gid of the supervisor itself.
    fn current(&self) -> (u32, u32);

    /// Resolve to the (uid, gid) a plugin should be launched with.
    fn resolve(&self, run_as: &RunAs) -> Option<(u32, u32)> {
        match run_as {
            RunAs::Inherit => Some(self.current()),
            RunAs::Named { user, group } => {
                let (uid, primary_gid) = self.lookup_user(user)?;
                let gid = match group {
                    Some(group) => self.lookup_group(group)?,
                    None => primary_gid,
                };
                Some((uid, gid))
            }
        }
    }
}

/// Resolves identities through the system user/group database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentityResolver;

impl IdentityResolver for SystemIdentityResolver {
    fn lookup_user(&self, user: &str) -> Option<(u32, u32)> {
        match User::from_name(user) {
            Ok(found) => found.map(|u| (u.uid.as_raw(), u.gid.as_raw())),
            Err(e) => {
                warn!("Cannot look up user '{}': {}", user, e);
                None
            }
        }
    }

    fn lookup_group(&self, group: &str) -> Option<u32> {
        match Group::from_name(group) {
            Ok(found) => found.map(|g| g.gid.as_raw()),
            Err(e) => {
                warn!("Cannot look up group '{}': {}", group, e);
                None
            }
        }
    }

    fn current(&self) -> (u32, u32) {
        (geteuid().as_raw(), getegid().as_raw())
    }
}

/// Contents of the identity side file consumed by provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFile {
    pub users: BTreeMap<String, u32>,
    pub groups: BTreeMap<String, u32>,
}

impl IdentityFile {
    /// Collect the distinct non-root users and groups named by `run_as`
    /// entries, plus `ipc_group`. Names that do not resolve are left out.
    pub fn collect<'a>(
        run_as: impl IntoIterator<Item = &'a RunAs>,
        ipc_group: &str,
        resolver: &dyn IdentityResolver,
    ) -> Self {
        let mut file = IdentityFile::default();

        let add_group = |file: &mut IdentityFile, group: &str| {
            if group == ROOT || file.groups.contains_key(group) {
                return;
            }
            match resolver.lookup_group(group) {
                Some(gid) => {
                    file.groups.insert(group.to_string(), gid);
                }
                None => warn!("Group '{}' does not exist yet", group),
            }
        };

        for entry in run_as {
            if let Some(user) = entry.user() {
                if user != ROOT && !file.users.contains_key(user) {
                    match resolver.lookup_user(user) {
                        Some((uid, _)) => {
                            file.users.insert(user.to_string(), uid);
                        }
                        None => warn!("User '{}' does not exist yet", user),
                    }
                }
            }
            if let Some(group) = entry.group() {
                add_group(&mut file, group);
            }
        }

        if !ipc_group.is_empty() {
            add_group(&mut file, ipc_group);
        }

        file
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs.write_file(path, &json)?;
        debug!(
            "Wrote {} users and {} groups to {}",
            self.users.len(),
            self.groups.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testing::{MemoryFileSystem, StaticIdentityResolver};

    #[test]
    fn parses_user_and_group_forms() {
        assert_eq!("".parse::<RunAs>().unwrap(), RunAs::Inherit);
        assert_eq!(
            "scanner".parse::<RunAs>().unwrap(),
            RunAs::Named {
                user: "scanner".into(),
                group: None
            }
        );
        let run_as: RunAs = "agent:ipc".parse().unwrap();
        assert_eq!(run_as.user(), Some("agent"));
        assert_eq!(run_as.group(), Some("ipc"));
    }

    #[test]
    fn rejects_malformed_identities() {
        assert!(":group".parse::<RunAs>().is_err());
        assert!("user:".parse::<RunAs>().is_err());
        assert!("a:b:c".parse::<RunAs>().is_err());
    }

    #[test]
    fn resolve_uses_primary_group_unless_overridden() {
        let resolver = StaticIdentityResolver::new()
            .user("agent", 1001, 1001)
            .group("ipc", 2000);

        assert_eq!(resolver.resolve(&"agent".parse().unwrap()), Some((1001, 1001)));
        assert_eq!(resolver.resolve(&"agent:ipc".parse().unwrap()), Some((1001, 2000)));
        assert_eq!(resolver.resolve(&"agent:missing".parse().unwrap()), None);
        assert_eq!(resolver.resolve(&"ghost".parse().unwrap()), None);
        assert_eq!(resolver.resolve(&RunAs::Inherit), Some(resolver.current()));
    }

    #[test]
    fn identity_file_skips_root_and_dedups() {
        let resolver = StaticIdentityResolver::new()
            .user("root", 0, 0)
            .user("agent", 1001, 1001)
            .user("scanner", 1002, 1002)
            .group("root", 0)
            .group("ipc", 2000)
            .group("scan", 2001);

        let entries: Vec<RunAs> = ["root", "agent:ipc", "agent", "scanner:scan", "root:root"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let file = IdentityFile::collect(&entries, "ipc", &resolver);

        assert_eq!(file.users.len(), 2);
        assert_eq!(file.users["agent"], 1001);
        assert_eq!(file.users["scanner"], 1002);
        assert_eq!(file.groups.len(), 2);
        assert_eq!(file.groups["ipc"], 2000);
        assert_eq!(file.groups["scan"], 2001);
    }

    #[test]
    fn identity_file_round_trips_through_json() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/opt/agent/etc/identities.json");
        let mut file = IdentityFile::default();
        file.users.insert("agent".into(), 1001);
        file.groups.insert("ipc".into(), 2000);

        file.save(&fs, path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs.read_file(path).unwrap()).unwrap();
        assert_eq!(json["users"]["agent"], 1001);
        assert_eq!(json["groups"]["ipc"], 2000);
    }

    #[test]
    fn system_resolver_knows_root() {
        assert_eq!(SystemIdentityResolver.lookup_user("root").map(|(uid, _)| uid), Some(0));
        assert!(SystemIdentityResolver.lookup_user("no-such-user-xyz").is_none());
    }

    #[test]
    fn system_resolver_knows_groups_and_self() {
        assert_eq!(SystemIdentityResolver.lookup_group("root"), Some(0));
        assert!(SystemIdentityResolver.lookup_group("no-such-group-xyz").is_none());

        let (uid, gid) = SystemIdentityResolver.current();
        assert_eq!(
            SystemIdentityResolver.resolve(&RunAs::Inherit),
            Some((uid, gid))
        );
    }
}
