use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{Pid, PidExt, ProcessExt, ProcessStatus, System, SystemExt};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KillError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("failed to terminate process {0}")]
    Refused(u32),
}

/// Parent/child view of the process table at one point in time.
#[derive(Debug, Default)]
pub struct ProcessTree {
    known: HashSet<u32>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTree {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, Option<u32>)>) -> Self {
        let mut tree = Self::default();
        for (pid, parent) in pairs {
            tree.known.insert(pid);
            if let Some(parent) = parent.filter(|p| *p != pid) {
                tree.children.entry(parent).or_default().push(pid);
            }
        }
        tree
    }

    pub fn snapshot(system: &System) -> Self {
        Self::from_pairs(system.processes().iter().filter_map(|(pid, proc_)| {
            if proc_.status() == ProcessStatus::Zombie {
                return None;
            }
            Some((pid.as_u32(), proc_.parent().map(|p| p.as_u32())))
        }))
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.known.contains(&pid)
    }

    /// All transitive children of `root`, breadth first. `root` itself is excluded.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(pid) = queue.pop_front() {
            for child in self.children.get(&pid).into_iter().flatten() {
                if seen.insert(*child) {
                    out.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        out
    }
}

/// Terminates `pid` and everything it spawned.
///
/// Children are killed first. A child that refuses to die is logged and
/// skipped; only failure on the parent itself is reported.
pub fn kill_proc(pid: u32) -> Result<(), KillError> {
    let mut system = System::new();
    system.refresh_processes();
    let tree = ProcessTree::snapshot(&system);
    kill_tree_with(&tree, pid, |target| {
        system
            .process(Pid::from_u32(target))
            .map(|p| p.kill())
            .unwrap_or(false)
    })
}

pub(crate) fn kill_tree_with(
    tree: &ProcessTree,
    root: u32,
    mut kill: impl FnMut(u32) -> bool,
) -> Result<(), KillError> {
    if !tree.contains(root) {
        return Err(KillError::NotFound(root));
    }
    for child in tree.descendants(root) {
        if !kill(child) {
            debug!(pid = child, parent = root, "failed to kill child process");
        }
    }
    if kill(root) {
        Ok(())
    } else {
        Err(KillError::Refused(root))
    }
}

/// Kills whatever is left of a timed-out run rooted at `root`, which may have
/// exited already. On unix the run leads its own process group, so the group
/// is signalled first; that reaches children reparented away from `root`.
/// Windows keeps the dead parent's id on orphans, so they are still found by
/// walking the snapshot.
pub fn kill_run(root: u32) {
    #[cfg(unix)]
    signal_group(root);

    let mut system = System::new();
    system.refresh_processes();
    let tree = ProcessTree::snapshot(&system);
    let result = kill_run_with(&tree, root, cfg!(windows), |target| {
        system
            .process(Pid::from_u32(target))
            .map(|p| p.kill())
            .unwrap_or(false)
    });
    if let Err(err) = result {
        debug!(pid = root, error = %err, "run cleanup incomplete");
    }
}

pub(crate) fn kill_run_with(
    tree: &ProcessTree,
    root: u32,
    orphans_keep_parent: bool,
    mut kill: impl FnMut(u32) -> bool,
) -> Result<(), KillError> {
    match kill_tree_with(tree, root, &mut kill) {
        Err(KillError::NotFound(_)) if orphans_keep_parent => {
            for orphan in tree.descendants(root) {
                if !kill(orphan) {
                    debug!(pid = orphan, parent = root, "failed to kill orphaned process");
                }
            }
            Ok(())
        }
        // Nothing left under the root; the group signal did the rest.
        Err(KillError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    if pgid <= 1 {
        return;
    }
    // SAFETY: a negative pid addresses the process group only.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, error = %err, "failed to signal process group");
        }
    }
}

/// Kills every process whose executable name or path matches `matches`,
/// returning how many were signalled.
pub fn kill_matching(matches: impl Fn(&str, &str) -> bool) -> usize {
    let mut system = System::new();
    system.refresh_processes();
    let own = std::process::id();
    let mut killed = 0;
    for (pid, proc_) in system.processes() {
        if pid.as_u32() == own {
            continue;
        }
        let exe = proc_.exe().to_string_lossy();
        if matches(proc_.name(), &exe) && proc_.kill() {
            debug!(pid = pid.as_u32(), name = proc_.name(), "force killed process");
            killed += 1;
        }
    }
    killed
}
