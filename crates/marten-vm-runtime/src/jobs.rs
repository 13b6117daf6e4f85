//! Job pump
//!
//! The core never spins: the host drains one job per
//! `execute_pending_job` call. `run_jobs` is the standard drain loop:
//! until the queue is empty or a job throws.

use marten_vm_core::{Context, Runtime, Value};

/// Drain the job queue. Returns the number of jobs run, or the throwing
/// job's context and exception.
pub fn run_jobs(rt: &Runtime) -> Result<usize, (Context, Value)> {
    let mut count = 0;
    loop {
        match rt.execute_pending_job() {
            Ok(None) => return Ok(count),
            Ok(Some(_)) => count += 1,
            Err(err) => return Err(err),
        }
    }
}

/// Drain the job queue, ignoring job exceptions (they have already been
/// reported through the rejection tracker where applicable).
pub fn run_jobs_lossy(rt: &Runtime) -> usize {
    let mut count = 0;
    loop {
        match rt.execute_pending_job() {
            Ok(None) => return count,
            Ok(Some(_)) | Err(_) => count += 1,
        }
    }
}
