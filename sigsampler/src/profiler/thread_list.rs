//! Thread discovery
//!
//! Lists the threads of a process by reading the /proc filesystem.

use std::collections::BTreeSet;
use std::fs;
use std::io;

use crate::domain::{Pid, Tid};

/// Thread ids currently listed under /proc/<pid>/task
///
/// # Errors
/// Returns an error if the task directory cannot be read
pub fn list_threads(pid: Pid) -> io::Result<BTreeSet<Tid>> {
    let task_dir = format!("/proc/{}/task", pid.0);

    let tids = fs::read_dir(task_dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_str()?.parse::<u32>().ok().map(Tid)
        })
        .collect();

    Ok(tids)
}

/// Name of a thread as shown in /proc/<pid>/task/<tid>/comm
pub fn thread_name(pid: Pid, tid: Tid) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/{}/task/{}/comm", pid.0, tid.0)).ok()?;
    Some(comm.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;
    use std::sync::mpsc;

    #[test]
    fn test_lists_calling_thread() {
        let threads = list_threads(Pid::current()).unwrap();
        assert!(threads.contains(&Tid(os::thread_id())));
    }

    #[test]
    fn test_sees_new_named_thread() {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("list-named".into())
            .spawn(move || {
                tid_tx.send(os::thread_id()).unwrap();
                let _ = done_rx.recv();
            })
            .unwrap();

        let tid = Tid(tid_rx.recv().unwrap());
        assert!(list_threads(Pid::current()).unwrap().contains(&tid));
        assert_eq!(thread_name(Pid::current(), tid).as_deref(), Some("list-named"));

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_invalid_pid() {
        assert!(list_threads(Pid(u32::MAX)).is_err());
    }
}
