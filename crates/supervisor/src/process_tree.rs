//! Signals delivered to a process and every process it spawned.
//!
//! av1an starts its own decoders and encoders, so suspending or killing only
//! the av1an pid would leave the actual work running.

use std::collections::HashMap;

use log::{debug, warn};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};

/// Signals the supervisor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    Suspend,
    Continue,
    Terminate,
    Kill,
}

impl TreeSignal {
    fn as_sysinfo(&self) -> Signal {
        match self {
            TreeSignal::Suspend => Signal::Stop,
            TreeSignal::Continue => Signal::Continue,
            TreeSignal::Terminate => Signal::Term,
            TreeSignal::Kill => Signal::Kill,
        }
    }
}

fn process_table() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

/// `root` followed by all of its descendants, parents before children
pub fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        if let Some(kids) = children.get(&tree[next]) {
            for kid in kids {
                if !tree.contains(kid) {
                    tree.push(*kid);
                }
            }
        }
        next += 1;
    }
    tree
}

/// Send `signal` to `pid` and its descendants. Returns how many processes
/// accepted the signal.
pub fn signal_tree(pid: u32, signal: TreeSignal) -> usize {
    let system = process_table();
    let root = Pid::from_u32(pid);
    let tree = descendants(&system, root);

    let mut delivered = 0;
    for member in &tree {
        let Some(process) = system.process(*member) else {
            continue;
        };
        match process.kill_with(signal.as_sysinfo()) {
            Some(true) => delivered += 1,
            Some(false) => debug!("{:?} not delivered to pid {}", signal, member),
            None => {
                warn!("{:?} is not supported on this platform", signal);
                break;
            }
        }
    }
    debug!(
        "{:?} sent to {}/{} process(es) under pid {}",
        signal,
        delivered,
        tree.len(),
        pid
    );
    delivered
}
