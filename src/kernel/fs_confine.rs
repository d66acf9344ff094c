/// Workspace-only writes through Landlock.
///
/// The ruleset is created in the parent, where it can open the workspace
/// and fail loudly, and only `restrict` runs between fork and exec. Reads
/// stay unrestricted; runtimes need their libraries.
use landlock::{
    path_beneath_rules, Access, AccessFs, RestrictionStatus, Ruleset, RulesetAttr,
    RulesetCreated, RulesetCreatedAttr, RulesetStatus, ABI,
};
use std::io;
use std::path::Path;
use std::sync::OnceLock;

/// Newest ABI the rules are written for; older kernels get the subset they
/// understand.
const TARGET_ABI: ABI = ABI::V3;

const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1;

/// Landlock ABI version of the running kernel, or `None` when the LSM is
/// missing or disabled.
pub fn abi_version() -> Option<u32> {
    static VERSION: OnceLock<Option<u32>> = OnceLock::new();
    *VERSION.get_or_init(|| {
        let version = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                std::ptr::null::<libc::c_void>(),
                0 as libc::size_t,
                LANDLOCK_CREATE_RULESET_VERSION,
            )
        };
        if version > 0 {
            log::debug!("Landlock ABI v{}", version);
            Some(version as u32)
        } else {
            log::warn!(
                "Landlock unavailable ({}); filesystem confinement falls back to denying all writes",
                io::Error::last_os_error()
            );
            None
        }
    })
}

/// Writes allowed beneath `workspace` (and to /dev/null) only.
pub fn workspace_ruleset(workspace: &Path) -> Result<RulesetCreated, landlock::RulesetError> {
    let access = AccessFs::from_write(TARGET_ABI);
    Ruleset::default()
        .handle_access(access)?
        .create()?
        .add_rules(path_beneath_rules([workspace, Path::new("/dev/null")], access))
}

/// Apply a ruleset to the calling process. Safe between fork and exec:
/// no allocation on any path.
pub fn restrict(ruleset: RulesetCreated) -> io::Result<()> {
    match ruleset.restrict_self() {
        Ok(RestrictionStatus {
            ruleset: RulesetStatus::NotEnforced,
            ..
        }) => Err(io::Error::from_raw_os_error(libc::ENOSYS)),
        Ok(_) => Ok(()),
        Err(_) => Err(io::Error::from_raw_os_error(libc::EPERM)),
    }
}
